//! Controlled hardware elements and the session element registry.
//!
//! The engine never talks to hardware directly; it holds `Arc<dyn Element>`
//! handles resolved from parameter tokens. The only operations it needs are
//! reservation notification (`reserve`/`unreserve`, once per reserving
//! macro) and best-effort `abort`/`stop`, which the executor invokes on
//! every element reserved by a macro when the session is interrupted.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use std::sync::Arc;

/// A controllable element (motor, counter, measurement group, ...) that a
/// macro can receive as a parameter and that the executor can interrupt.
#[async_trait]
pub trait Element: Send + Sync {
    /// Unique element name, as referenced by parameter tokens.
    fn name(&self) -> &str;

    /// Element kind, matching a registered parameter type name
    /// (e.g. `"Motor"`, `"Counter"`).
    fn kind(&self) -> &str;

    /// Elements that must be stopped before the rest of the reservation set
    /// (e.g. a measurement group gating its channels).
    fn stop_first(&self) -> bool {
        false
    }

    /// Notification that a macro reserved this element. Called once per
    /// reserving macro. Default no-op.
    fn reserve(&self) {}

    /// Notification that the reserving macro released this element.
    /// Default no-op.
    fn unreserve(&self) {}

    /// Best-effort immediate interruption of any ongoing operation.
    async fn abort(&self) -> anyhow::Result<()>;

    /// Best-effort graceful interruption (controlled deceleration).
    async fn stop(&self) -> anyhow::Result<()>;
}

/// Name-indexed registry of the elements visible to a session.
///
/// Element-kind parameter types resolve tokens through this registry; a
/// token that matches no element is an unknown-parameter-object error.
#[derive(Default)]
pub struct ElementRegistry {
    elements: RwLock<HashMap<String, Arc<dyn Element>>>,
}

impl ElementRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an element under its own name, replacing any previous
    /// element with the same name.
    pub fn register(&self, element: Arc<dyn Element>) {
        let name = element.name().to_string();
        if let Ok(mut map) = self.elements.write() {
            map.insert(name, element);
        }
    }

    /// Look up an element by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Element>> {
        self.elements.read().ok()?.get(name).cloned()
    }

    /// Look up an element by name, also checking its kind.
    pub fn get_of_kind(&self, name: &str, kind: &str) -> Option<Arc<dyn Element>> {
        self.get(name).filter(|e| e.kind() == kind)
    }

    /// Names of all registered elements, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .elements
            .read()
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }
}

pub mod mock {
    //! Mock elements for tests and the demo session.

    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-memory element that records how often it was reserved and
    /// interrupted.
    pub struct MockElement {
        name: String,
        kind: String,
        stop_first: bool,
        reserves: AtomicUsize,
        unreserves: AtomicUsize,
        aborts: AtomicUsize,
        stops: AtomicUsize,
    }

    impl MockElement {
        /// Create a mock element of the given kind.
        pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
            Self {
                name: name.into(),
                kind: kind.into(),
                stop_first: false,
                reserves: AtomicUsize::new(0),
                unreserves: AtomicUsize::new(0),
                aborts: AtomicUsize::new(0),
                stops: AtomicUsize::new(0),
            }
        }

        /// Mark this element as stop-first priority.
        pub fn with_stop_first(mut self) -> Self {
            self.stop_first = true;
            self
        }

        /// Number of `reserve` calls received.
        pub fn reserve_count(&self) -> usize {
            self.reserves.load(Ordering::SeqCst)
        }

        /// Number of `unreserve` calls received.
        pub fn unreserve_count(&self) -> usize {
            self.unreserves.load(Ordering::SeqCst)
        }

        /// Number of `abort` calls received.
        pub fn abort_count(&self) -> usize {
            self.aborts.load(Ordering::SeqCst)
        }

        /// Number of `stop` calls received.
        pub fn stop_count(&self) -> usize {
            self.stops.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Element for MockElement {
        fn name(&self) -> &str {
            &self.name
        }

        fn kind(&self) -> &str {
            &self.kind
        }

        fn stop_first(&self) -> bool {
            self.stop_first
        }

        fn reserve(&self) {
            self.reserves.fetch_add(1, Ordering::SeqCst);
        }

        fn unreserve(&self) {
            self.unreserves.fetch_add(1, Ordering::SeqCst);
        }

        async fn abort(&self) -> anyhow::Result<()> {
            self.aborts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> anyhow::Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockElement;
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let registry = ElementRegistry::new();
        registry.register(Arc::new(MockElement::new("mot01", "Motor")));
        registry.register(Arc::new(MockElement::new("ct01", "Counter")));

        assert!(registry.get("mot01").is_some());
        assert!(registry.get_of_kind("mot01", "Motor").is_some());
        assert!(registry.get_of_kind("mot01", "Counter").is_none());
        assert!(registry.get("mot99").is_none());
        assert_eq!(registry.names(), vec!["ct01", "mot01"]);
    }

    #[tokio::test]
    async fn test_mock_interrupt_counters() {
        let elem = MockElement::new("mot01", "Motor");
        elem.abort().await.unwrap();
        elem.abort().await.unwrap();
        elem.stop().await.unwrap();
        assert_eq!(elem.abort_count(), 2);
        assert_eq!(elem.stop_count(), 1);
    }

    #[test]
    fn test_mock_reservation_counters() {
        let elem = MockElement::new("mot01", "Motor");
        elem.reserve();
        elem.unreserve();
        assert_eq!(elem.reserve_count(), 1);
        assert_eq!(elem.unreserve_count(), 1);
    }
}
