use crate::backends::SampledInputs;
use crate::binding::{BindingError, Committed, KeyMap, PhysicalBinding};
use crate::config::Config;
use crate::device::Sampler;
use crate::error::{ConfigError, Error, Result};
use crate::event::{Code, SourceKind};
use crate::eventbus::{EventBus, EventFilter, Publisher, Subscriber};
use crate::key::LogicalKey;
use crate::pipeline::{Control, Pipeline, SourceHealth, SourceSetup};
use crate::snapshot::Snapshot;
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, info, warn};

struct PipelineHandle {
    source: SourceKind,
    control: Sender<Control>,
    health: Arc<SourceHealth>,
    thread: Option<JoinHandle<()>>,
}

/// Owns the source pipelines, the shared publisher and the subscriber bus.
///
/// ```no_run
/// use keyrelay::{Config, EventFilter, InputManager, LogSubscriber};
///
/// # fn main() -> keyrelay::Result<()> {
/// let mut manager = InputManager::new(Config::load("/etc/keyrelay/keyrelay.toml")?)?;
/// manager.subscribe(LogSubscriber::new(), EventFilter::All);
/// manager.start()?;
/// for sampler in keyrelay::backends::probe_samplers(manager.config()) {
///     manager.add_source(sampler)?;
/// }
/// # Ok(())
/// # }
/// ```
pub struct InputManager {
    config: Config,
    keymap: Arc<KeyMap>,
    /// What the startup configuration had the samplers open.
    sampled: SampledInputs,
    publisher: Arc<Publisher>,
    bus: Arc<Mutex<EventBus>>,
    dispatcher: Option<JoinHandle<()>>,
    pipelines: Vec<PipelineHandle>,
}

impl InputManager {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let keymap = Arc::new(config.keymap()?);
        let missing = keymap.missing_required();
        if !missing.is_empty() {
            warn!(keys = ?missing, "required keys have no binding on any source");
        }
        let publisher = Arc::new(Publisher::new(config.publisher_config()));
        Ok(Self {
            sampled: SampledInputs::from_config(&config),
            config,
            keymap,
            publisher,
            bus: Arc::new(Mutex::new(EventBus::new())),
            dispatcher: None,
            pipelines: Vec::new(),
        })
    }

    fn bus(&self) -> MutexGuard<'_, EventBus> {
        self.bus.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start the dispatcher thread that delivers published events to subscribers.
    /// Without it, call [`drain`](Self::drain) to deliver synchronously.
    pub fn start(&mut self) -> Result<()> {
        if self.dispatcher.is_none() {
            let handle = self
                .publisher
                .spawn_dispatcher(Arc::clone(&self.bus))
                .map_err(|e| Error::Spawn("dispatcher".into(), e))?;
            self.dispatcher = Some(handle);
        }
        Ok(())
    }

    /// Spawn the pipeline for `sampler`'s source. One sampler per source.
    pub fn add_source(&mut self, sampler: Box<dyn Sampler>) -> Result<()> {
        let source = sampler.source();
        if self.pipelines.iter().any(|p| p.source == source) {
            return Err(Error::SourceExists(source));
        }
        let setup = SourceSetup::from_config(&self.config, source, Arc::clone(&self.keymap))?;
        let health = Arc::new(SourceHealth::new(source, sampler.name()));
        let pipeline = Pipeline::new(setup, Arc::clone(&self.publisher), Arc::clone(&health));
        let (control, rx) = mpsc::channel();

        let thread = thread::Builder::new()
            .name(format!("keyrelay-{source}"))
            .spawn(move || pipeline.run(sampler, rx))
            .map_err(|e| Error::Spawn(source.to_string(), e))?;

        info!(%source, "source added");
        self.pipelines.push(PipelineHandle {
            source,
            control,
            health,
            thread: Some(thread),
        });
        Ok(())
    }

    pub fn sources(&self) -> Vec<SourceKind> {
        self.pipelines.iter().map(|p| p.source).collect()
    }

    /// Registers a subscriber and returns its id.
    pub fn subscribe(&self, subscriber: impl Subscriber + 'static, filter: EventFilter) -> u64 {
        let id = self.bus().add(subscriber, filter);
        debug!(subscriber = id, ?filter, "subscriber added");
        id
    }

    pub fn subscribe_boxed(&self, subscriber: Box<dyn Subscriber>, filter: EventFilter) -> u64 {
        self.bus().add_boxed(subscriber, filter)
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        self.bus().remove(id)
    }

    pub fn set_subscriber_enabled(&self, id: u64, enabled: bool) {
        let mut bus = self.bus();
        if enabled {
            bus.enable(id);
        } else {
            bus.disable(id);
        }
    }

    /// Deliver everything queued right now on the calling thread.
    pub fn drain(&self) -> usize {
        let mut bus = self.bus();
        self.publisher.drain(&mut bus)
    }

    pub fn publisher(&self) -> &Arc<Publisher> {
        &self.publisher
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn keymap(&self) -> &KeyMap {
        &self.keymap
    }

    /// Edit one binding and push the new table to the affected source.
    ///
    /// Conflicting edits are rejected unless `confirmed`; see [`KeyMap::bind`].
    pub fn bind(
        &mut self,
        binding: PhysicalBinding,
        confirmed: bool,
    ) -> Result<Committed, BindingError> {
        let source = binding.source;
        let mut map = KeyMap::clone(&self.keymap);
        let committed = map.bind(binding, confirmed)?;
        for warning in &committed.warnings {
            warn!(%warning, "binding aliases a system key");
        }
        self.install_keymap(map, source);
        Ok(committed)
    }

    pub fn unbind(&mut self, source: SourceKind, code: &Code) -> Option<LogicalKey> {
        let mut map = KeyMap::clone(&self.keymap);
        let removed = map.unbind(source, code)?;
        self.install_keymap(map, source);
        Some(removed)
    }

    fn install_keymap(&mut self, map: KeyMap, source: SourceKind) {
        self.config.set_bindings(&map);
        self.keymap = Arc::new(map);
        if let Err(e) = self.push_setup(source) {
            warn!(%source, error = %e, "cannot rebuild pipeline after binding edit");
        }
        self.warn_unsampled();
    }

    /// Inputs the current configuration uses that the samplers opened at startup
    /// do not read. Bindings on them stay silent until a restart.
    pub fn unsampled_inputs(&self) -> Vec<String> {
        self.sampled
            .missing(&SampledInputs::from_config(&self.config))
    }

    fn warn_unsampled(&self) {
        for input in self.unsampled_inputs() {
            warn!(%input, "input is not sampled; restart to apply");
        }
    }

    fn push_setup(&mut self, source: SourceKind) -> Result<(), ConfigError> {
        let Some(handle) = self.pipelines.iter().find(|p| p.source == source) else {
            return Ok(());
        };
        let setup = SourceSetup::from_config(&self.config, source, Arc::clone(&self.keymap))?;
        if handle.control.send(Control::Reload(Box::new(setup))).is_err() {
            warn!(%source, "pipeline is gone, reload not delivered");
        }
        Ok(())
    }

    /// Replace the configuration of every running source.
    ///
    /// Nothing changes unless the whole new configuration is valid. Publisher
    /// settings and source enable flags only take effect on restart.
    pub fn reload(&mut self, config: Config) -> Result<(), ConfigError> {
        config.validate()?;
        let keymap = Arc::new(config.keymap()?);
        let mut setups = Vec::with_capacity(self.pipelines.len());
        for handle in &self.pipelines {
            setups.push(SourceSetup::from_config(
                &config,
                handle.source,
                Arc::clone(&keymap),
            )?);
        }

        if config.publisher != self.config.publisher {
            warn!("publisher settings changed; restart to apply them");
        }
        for source in SourceKind::ALL {
            if config.source_enabled(source) != self.config.source_enabled(source) {
                warn!(%source, "source enable flag changed; restart to apply it");
            }
        }

        for (handle, setup) in self.pipelines.iter().zip(setups) {
            if handle.control.send(Control::Reload(Box::new(setup))).is_err() {
                warn!(source = %handle.source, "pipeline is gone, reload not delivered");
            }
        }
        self.config = config;
        self.keymap = keymap;
        info!(bindings = self.keymap.len(), "configuration reloaded");
        self.warn_unsampled();
        Ok(())
    }

    pub fn snapshot(&self) -> Snapshot {
        let now = Instant::now();
        let mut sources: Vec<_> = self.pipelines.iter().map(|p| p.health.status(now)).collect();
        sources.sort_by_key(|s| s.source);
        Snapshot {
            dropped: self.publisher.dropped(),
            published: self.publisher.published(),
            sources,
        }
    }

    /// Stop every pipeline, flush the queue to subscribers and join all threads.
    pub fn shutdown(&mut self) {
        for handle in &self.pipelines {
            let _ = handle.control.send(Control::Shutdown);
        }
        for handle in &mut self.pipelines {
            if let Some(thread) = handle.thread.take() {
                if thread.join().is_err() {
                    warn!(source = %handle.source, "pipeline thread panicked");
                }
            }
        }
        self.pipelines.clear();

        self.publisher.close();
        match self.dispatcher.take() {
            Some(thread) => {
                if thread.join().is_err() {
                    warn!("dispatcher thread panicked");
                }
            }
            None => {
                self.drain();
            }
        }
    }
}

impl Drop for InputManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::virtual_input::VirtualSampler;
    use crate::event::ClassifiedEvent;

    fn config() -> Config {
        Config::parse(
            r#"
            [bindings.gpio]
            "17" = "KEY_LEFT"
            [bindings.ir]
            KEY_OK = "KEY_OK"
            "#,
        )
        .unwrap()
    }

    #[test]
    fn rejects_second_sampler_for_a_source() {
        let mut manager = InputManager::new(config()).unwrap();
        let (a, _ha) = VirtualSampler::new(SourceKind::Gpio);
        let (b, _hb) = VirtualSampler::new(SourceKind::Gpio);
        manager.add_source(Box::new(a)).unwrap();
        assert!(matches!(
            manager.add_source(Box::new(b)),
            Err(Error::SourceExists(SourceKind::Gpio))
        ));
        assert_eq!(manager.sources(), vec![SourceKind::Gpio]);
        manager.shutdown();
    }

    #[test]
    fn conflicting_bind_needs_confirmation() {
        let mut manager = InputManager::new(config()).unwrap();
        let requested = PhysicalBinding::new(
            SourceKind::Gpio,
            Code::Pin(17),
            LogicalKey::new("KEY_BACK").unwrap(),
        );

        assert!(manager.bind(requested.clone(), false).is_err());
        assert_eq!(
            manager.keymap().resolve(SourceKind::Gpio, &Code::Pin(17)),
            Some(&LogicalKey::new("KEY_LEFT").unwrap())
        );

        let committed = manager.bind(requested, true).unwrap();
        assert_eq!(committed.replaced.len(), 1);
        assert_eq!(
            manager.config().bindings.gpio.get("17").map(LogicalKey::as_str),
            Some("KEY_BACK")
        );
    }

    #[test]
    fn invalid_reload_keeps_previous_config() {
        let mut manager = InputManager::new(config()).unwrap();
        let mut bad = config();
        bad.publisher.queue_depth = 0;
        assert!(manager.reload(bad).is_err());
        assert_eq!(manager.config(), &config());
    }

    #[test]
    fn edits_on_unopened_inputs_are_reported() {
        let startup = Config::parse(
            r#"
            [sources.gpio]
            enabled = true
            [sources.rotary]
            enabled = true
            encoders = [{ id = 0, pin_a = 5, pin_b = 6 }]
            [bindings.gpio]
            "17" = "KEY_LEFT"
            "#,
        )
        .unwrap();
        let mut manager = InputManager::new(startup.clone()).unwrap();
        assert!(manager.unsampled_inputs().is_empty());

        manager
            .bind(
                PhysicalBinding::new(
                    SourceKind::Gpio,
                    Code::Pin(22),
                    LogicalKey::new("KEY_BACK").unwrap(),
                ),
                false,
            )
            .unwrap();
        assert_eq!(manager.unsampled_inputs(), vec!["gpio line 22".to_string()]);

        let mut reloaded = startup;
        reloaded.sources.rotary.encoders[0].pin_b = 13;
        manager.reload(reloaded).unwrap();
        assert_eq!(manager.unsampled_inputs(), vec!["encoder line 13".to_string()]);
    }

    #[test]
    fn snapshot_lists_sources_in_kind_order() {
        let mut manager = InputManager::new(config()).unwrap();
        for source in [SourceKind::Ir, SourceKind::Touch, SourceKind::Gpio] {
            let (sampler, _handle) = VirtualSampler::new(source);
            manager.add_source(Box::new(sampler)).unwrap();
        }
        let order: Vec<SourceKind> = manager.snapshot().iter().map(|s| s.source).collect();
        assert_eq!(order, vec![SourceKind::Gpio, SourceKind::Touch, SourceKind::Ir]);
        manager.shutdown();
    }

    #[test]
    fn drain_delivers_synchronously() {
        let manager = InputManager::new(config()).unwrap();
        let (tx, rx) = mpsc::channel::<ClassifiedEvent>();
        manager.subscribe(tx, EventFilter::All);
        manager.publisher().publish(ClassifiedEvent {
            key: LogicalKey::new("KEY_OK").unwrap(),
            action: crate::event::ActionKind::Press,
            at: Instant::now(),
            source: SourceKind::Ir,
        });
        assert_eq!(manager.drain(), 1);
        assert_eq!(rx.try_iter().count(), 1);
    }
}
