//! Ordered fan-out of messages to registered receivers

use crate::message::Message;
use std::sync::{Arc, RwLock};
use tracing::trace;

/// Something that wants to see every message routed through a [`Dispatcher`]
pub trait Receiver: Send + Sync {
    fn recv_msg(&self, message: &Message);
}

impl<F> Receiver for F
where
    F: Fn(&Message) + Send + Sync,
{
    fn recv_msg(&self, message: &Message) {
        self(message)
    }
}

/// Delivers each message to every listener, in registration order.
///
/// Delivery is synchronous. The listener list is snapshotted before
/// delivery, so a listener may register further listeners without
/// deadlocking; those only see subsequent messages.
#[derive(Default)]
pub struct Dispatcher {
    listeners: RwLock<Vec<Arc<dyn Receiver>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: Arc<dyn Receiver>) {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        listeners.push(listener);
    }

    pub fn add_listeners<I>(&self, listeners: I)
    where
        I: IntoIterator<Item = Arc<dyn Receiver>>,
    {
        let mut current = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        current.extend(listeners);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Deliver `message` to all listeners; with no listeners this is a no-op
    pub fn send_message(&self, message: &Message) {
        let snapshot: Vec<Arc<dyn Receiver>> = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        trace!(code = %message.code(), listeners = snapshot.len(), "Dispatching message");
        for listener in snapshot {
            listener.recv_msg(message);
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        name: &'static str,
        seen: Arc<Mutex<Vec<String>>>,
    }

    impl Receiver for Recorder {
        fn recv_msg(&self, message: &Message) {
            self.seen
                .lock()
                .unwrap()
                .push(format!("{}:{}", self.name, message.code()));
        }
    }

    #[test]
    fn test_delivers_in_registration_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = Dispatcher::new();
        dispatcher.add_listener(Arc::new(Recorder { name: "a", seen: seen.clone() }));
        dispatcher.add_listener(Arc::new(Recorder { name: "b", seen: seen.clone() }));

        dispatcher.send_message(&Message::ack());
        dispatcher.send_message(&Message::stop());

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["a:control/Ack", "b:control/Ack", "a:control/Stop", "b:control/Stop"]
        );
    }

    #[test]
    fn test_no_listeners_is_a_noop() {
        let dispatcher = Dispatcher::new();
        dispatcher.send_message(&Message::ack());
        assert_eq!(dispatcher.listener_count(), 0);
    }

    #[test]
    fn test_listener_may_register_during_delivery() {
        let dispatcher = Arc::new(Dispatcher::new());
        let count = Arc::new(Mutex::new(0usize));

        let inner = dispatcher.clone();
        let counter = count.clone();
        dispatcher.add_listener(Arc::new(move |_: &Message| {
            let counter = counter.clone();
            inner.add_listener(Arc::new(move |_: &Message| {
                *counter.lock().unwrap() += 1;
            }));
        }));

        dispatcher.send_message(&Message::ack());
        assert_eq!(dispatcher.listener_count(), 2);
        assert_eq!(*count.lock().unwrap(), 0);

        dispatcher.send_message(&Message::ack());
        assert_eq!(*count.lock().unwrap(), 1);
    }
}
