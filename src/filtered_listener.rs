use crate::event::ClassifiedEvent;
use crate::eventbus::{Disconnected, Subscriber};

/// Wraps a subscriber and forwards only events accepted by a predicate.
///
/// Unlike [`EventFilter`](crate::eventbus::EventFilter), the predicate may capture
/// state (a key set loaded from config, for instance).
pub struct FilteredSubscriber {
    predicate: Box<dyn Fn(&ClassifiedEvent) -> bool + Send + Sync>,
    inner: Box<dyn Subscriber>,
}

impl FilteredSubscriber {
    pub fn new(
        predicate: impl Fn(&ClassifiedEvent) -> bool + Send + Sync + 'static,
        inner: Box<dyn Subscriber>,
    ) -> Self {
        Self {
            predicate: Box::new(predicate),
            inner,
        }
    }
}

impl Subscriber for FilteredSubscriber {
    fn deliver(&mut self, event: &ClassifiedEvent) -> Result<(), Disconnected> {
        if (self.predicate)(event) {
            self.inner.deliver(event)
        } else {
            Ok(())
        }
    }
}
