//! Macro definitions, libraries and the session macro registry.
//!
//! Macros are grouped into libraries. A library is anything implementing
//! [`MacroLibrarySource`]: it has a name and produces, on demand, the full
//! set of [`MacroRecord`]s it currently contains. Registration is explicit;
//! a record pairs an immutable [`MacroDefinition`] with a factory producing
//! a fresh task object per invocation.
//!
//! The registry keeps an ordered source list. When two sources define the
//! same macro name, the later source wins. Reloading a library is atomic
//! with respect to lookups: readers observe either the full old contents or
//! the full new contents, never a mix. A failed (re)load keeps the library
//! registered in the `Faulted` state, with its error record and zero macro
//! definitions.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{info, warn};

use crate::error::{ErrorRecord, MacroError, MacroResult};
use crate::params::ParamSpec;
use crate::task::MacroTask;

/// Immutable description of one macro: name, parameter schema, result
/// schema, hints and environment requirements.
#[derive(Debug, Clone)]
pub struct MacroDefinition {
    /// Macro name, unique within the session.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// Ordered parameter schema.
    pub params: Vec<ParamSpec>,
    /// Ordered result schema; empty for macros without results.
    pub results: Vec<ParamSpec>,
    /// Free-form hints, e.g. `allowsHooks` listing valid hook places.
    pub hints: HashMap<String, Vec<String>>,
    /// Environment keys that must be present before the macro starts.
    pub required_env: Vec<String>,
}

impl MacroDefinition {
    /// Start a definition with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            params: Vec::new(),
            results: Vec::new(),
            hints: HashMap::new(),
            required_env: Vec::new(),
        }
    }

    /// Set the description.
    pub fn with_description(mut self, text: impl Into<String>) -> Self {
        self.description = text.into();
        self
    }

    /// Append one parameter spec.
    pub fn with_param(mut self, spec: ParamSpec) -> Self {
        self.params.push(spec);
        self
    }

    /// Append one result spec.
    pub fn with_result(mut self, spec: ParamSpec) -> Self {
        self.results.push(spec);
        self
    }

    /// Set a hint.
    pub fn with_hint(mut self, key: impl Into<String>, values: Vec<String>) -> Self {
        self.hints.insert(key.into(), values);
        self
    }

    /// Declare a required environment key.
    pub fn with_required_env(mut self, key: impl Into<String>) -> Self {
        self.required_env.push(key.into());
        self
    }

    /// Hook places this macro runs, from the `allowsHooks` hint.
    pub fn allowed_hook_places(&self) -> &[String] {
        self.hints.get("allowsHooks").map_or(&[], Vec::as_slice)
    }

    /// True when the macro declares result values.
    pub fn has_result(&self) -> bool {
        !self.results.is_empty()
    }
}

/// Factory producing a fresh task object per invocation.
pub type MacroFactory = Arc<dyn Fn() -> Box<dyn MacroTask> + Send + Sync>;

/// One registered macro: its definition plus its task factory.
#[derive(Clone)]
pub struct MacroRecord {
    /// The immutable definition.
    pub definition: Arc<MacroDefinition>,
    factory: MacroFactory,
}

impl MacroRecord {
    /// Pair a definition with a factory.
    pub fn new(definition: MacroDefinition, factory: MacroFactory) -> Self {
        Self {
            definition: Arc::new(definition),
            factory,
        }
    }

    /// Instantiate a fresh task for one invocation.
    pub fn instantiate(&self) -> Box<dyn MacroTask> {
        (self.factory)()
    }
}

impl std::fmt::Debug for MacroRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MacroRecord")
            .field("name", &self.definition.name)
            .finish()
    }
}

/// A named provider of macro records.
pub trait MacroLibrarySource: Send + Sync {
    /// Library name, unique within the session.
    fn name(&self) -> &str;

    /// Produce the current full contents of the library. Called on initial
    /// registration and on every reload.
    fn load(&self) -> anyhow::Result<Vec<MacroRecord>>;
}

/// Load state of a registered library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LibraryState {
    /// Registered, never loaded.
    NotLoaded,
    /// Last (re)load succeeded.
    Loaded,
    /// Last (re)load failed; the error record is kept.
    Faulted,
}

impl std::fmt::Display for LibraryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LibraryState::NotLoaded => "not loaded",
            LibraryState::Loaded => "loaded",
            LibraryState::Faulted => "faulted",
        };
        write!(f, "{name}")
    }
}

/// Bookkeeping for one registered library.
#[derive(Debug, Clone)]
pub struct MacroLibrary {
    /// Library name.
    pub name: String,
    /// Current load state.
    pub state: LibraryState,
    /// Error of the last failed load, if any.
    pub error: Option<ErrorRecord>,
    /// Names of the macros this library currently provides.
    pub macro_names: Vec<String>,
}

struct RegistryInner {
    libraries: HashMap<String, MacroLibrary>,
    // macro name -> (owning library, record)
    macros: HashMap<String, (String, MacroRecord)>,
}

/// The session macro registry.
pub struct MacroRegistry {
    sources: RwLock<Vec<Arc<dyn MacroLibrarySource>>>,
    inner: RwLock<RegistryInner>,
}

impl Default for MacroRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MacroRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            sources: RwLock::new(Vec::new()),
            inner: RwLock::new(RegistryInner {
                libraries: HashMap::new(),
                macros: HashMap::new(),
            }),
        }
    }

    /// Replace the ordered source list and load every source. When two
    /// sources define the same macro name the later source wins.
    pub fn set_sources(&self, sources: Vec<Arc<dyn MacroLibrarySource>>) {
        if let Ok(mut current) = self.sources.write() {
            *current = sources.clone();
        }
        if let Ok(mut inner) = self.inner.write() {
            inner.libraries.clear();
            inner.macros.clear();
            for source in &sources {
                load_into(&mut inner, source.as_ref());
            }
        }
    }

    /// Reload one library by name. Lookups observe either the full old
    /// contents or the full new contents. A failed load leaves the library
    /// `Faulted` with zero macro definitions.
    pub fn reload_library(&self, name: &str) -> MacroResult<MacroLibrary> {
        let source = self
            .sources
            .read()
            .ok()
            .and_then(|s| s.iter().find(|s| s.name() == name).cloned())
            .ok_or_else(|| MacroError::UnknownMacroLibrary(name.to_string()))?;

        let mut inner = self
            .inner
            .write()
            .map_err(|_| MacroError::InvalidState("registry lock poisoned".to_string()))?;

        // Drop the old contents, but only entries this library still owns.
        if let Some(old) = inner.libraries.remove(name) {
            let stale: Vec<String> = old
                .macro_names
                .iter()
                .filter(|m| {
                    inner
                        .macros
                        .get(*m)
                        .is_some_and(|(owner, _)| owner == name)
                })
                .cloned()
                .collect();
            for macro_name in stale {
                inner.macros.remove(&macro_name);
            }
        }

        load_into(&mut inner, source.as_ref());
        inner
            .libraries
            .get(name)
            .cloned()
            .ok_or_else(|| MacroError::UnknownMacroLibrary(name.to_string()))
    }

    /// Look up a macro record by name.
    pub fn get_macro(&self, name: &str) -> MacroResult<MacroRecord> {
        self.inner
            .read()
            .ok()
            .and_then(|inner| inner.macros.get(name).map(|(_, rec)| rec.clone()))
            .ok_or_else(|| MacroError::UnknownMacro(name.to_string()))
    }

    /// Look up library bookkeeping by name.
    pub fn get_library(&self, name: &str) -> MacroResult<MacroLibrary> {
        self.inner
            .read()
            .ok()
            .and_then(|inner| inner.libraries.get(name).cloned())
            .ok_or_else(|| MacroError::UnknownMacroLibrary(name.to_string()))
    }

    /// Sorted names of all registered macros.
    pub fn macro_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .read()
            .map(|inner| inner.macros.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Sorted names of all registered libraries.
    pub fn library_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .read()
            .map(|inner| inner.libraries.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }
}

fn load_into(inner: &mut RegistryInner, source: &dyn MacroLibrarySource) {
    let name = source.name().to_string();
    match source.load() {
        Ok(records) => {
            let mut macro_names = Vec::with_capacity(records.len());
            for record in records {
                let macro_name = record.definition.name.clone();
                if let Some((other, _)) = inner.macros.get(&macro_name) {
                    if other != &name {
                        warn!(
                            macro_name = %macro_name,
                            old_library = %other,
                            new_library = %name,
                            "Macro name collision, later library wins"
                        );
                    }
                }
                inner.macros.insert(macro_name.clone(), (name.clone(), record));
                macro_names.push(macro_name);
            }
            info!(library = %name, macros = macro_names.len(), "Loaded macro library");
            inner.libraries.insert(
                name.clone(),
                MacroLibrary {
                    name,
                    state: LibraryState::Loaded,
                    error: None,
                    macro_names,
                },
            );
        }
        Err(err) => {
            warn!(library = %name, error = %err, "Macro library failed to load");
            inner.libraries.insert(
                name.clone(),
                MacroLibrary {
                    name,
                    state: LibraryState::Faulted,
                    error: Some(ErrorRecord::new("LoadError", err.to_string())),
                    macro_names: Vec::new(),
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{MacroContext, StepOutcome};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct NoopTask;

    #[async_trait]
    impl MacroTask for NoopTask {
        async fn step(&mut self, _ctx: &mut MacroContext) -> crate::error::MacroResult<StepOutcome> {
            Ok(StepOutcome::Done(None))
        }
    }

    fn record(name: &str) -> MacroRecord {
        MacroRecord::new(MacroDefinition::new(name), Arc::new(|| Box::new(NoopTask)))
    }

    struct ListSource {
        name: String,
        contents: Mutex<anyhow::Result<Vec<String>>>,
    }

    impl ListSource {
        fn new(name: &str, macros: &[&str]) -> Self {
            Self {
                name: name.to_string(),
                contents: Mutex::new(Ok(macros.iter().map(|s| s.to_string()).collect())),
            }
        }

        fn set(&self, contents: anyhow::Result<Vec<String>>) {
            if let Ok(mut guard) = self.contents.lock() {
                *guard = contents;
            }
        }
    }

    impl MacroLibrarySource for ListSource {
        fn name(&self) -> &str {
            &self.name
        }

        fn load(&self) -> anyhow::Result<Vec<MacroRecord>> {
            match &*self.contents.lock().map_err(|_| anyhow::anyhow!("lock"))? {
                Ok(names) => Ok(names.iter().map(|n| record(n)).collect()),
                Err(e) => Err(anyhow::anyhow!("{e}")),
            }
        }
    }

    #[test]
    fn test_set_sources_and_lookup() {
        let registry = MacroRegistry::new();
        registry.set_sources(vec![Arc::new(ListSource::new("scans", &["ascan", "mesh"]))]);

        assert!(registry.get_macro("ascan").is_ok());
        assert!(matches!(
            registry.get_macro("dscan"),
            Err(MacroError::UnknownMacro(_))
        ));
        let lib = registry.get_library("scans").unwrap();
        assert_eq!(lib.state, LibraryState::Loaded);
        assert_eq!(lib.macro_names.len(), 2);
    }

    #[test]
    fn test_later_source_wins_collision() {
        let registry = MacroRegistry::new();
        registry.set_sources(vec![
            Arc::new(ListSource::new("base", &["wa", "ct"])),
            Arc::new(ListSource::new("site", &["ct"])),
        ]);

        let inner = registry.inner.read().unwrap();
        let (owner, _) = inner.macros.get("ct").unwrap();
        assert_eq!(owner, "site");
    }

    #[test]
    fn test_reload_swaps_contents_atomically() {
        let source = Arc::new(ListSource::new("scans", &["ascan", "a2scan"]));
        let registry = MacroRegistry::new();
        registry.set_sources(vec![source.clone()]);

        source.set(Ok(vec!["ascan".to_string(), "mesh".to_string()]));
        let lib = registry.reload_library("scans").unwrap();

        assert_eq!(lib.state, LibraryState::Loaded);
        assert!(registry.get_macro("mesh").is_ok());
        assert!(registry.get_macro("a2scan").is_err());
    }

    #[test]
    fn test_failed_reload_faults_library() {
        let source = Arc::new(ListSource::new("scans", &["ascan"]));
        let registry = MacroRegistry::new();
        registry.set_sources(vec![source.clone()]);

        source.set(Err(anyhow::anyhow!("syntax error at line 3")));
        let lib = registry.reload_library("scans").unwrap();

        assert_eq!(lib.state, LibraryState::Faulted);
        assert!(lib.macro_names.is_empty());
        let error = lib.error.unwrap();
        assert!(error.message.contains("syntax error"));
        // Its macros are gone until a successful reload.
        assert!(registry.get_macro("ascan").is_err());
    }

    #[test]
    fn test_reload_keeps_entries_owned_by_other_library() {
        let base = Arc::new(ListSource::new("base", &["ct"]));
        let site = Arc::new(ListSource::new("site", &["ct", "wa"]));
        let registry = MacroRegistry::new();
        registry.set_sources(vec![base.clone(), site]);

        // "ct" is owned by "site"; reloading "base" must not remove it.
        registry.reload_library("base").unwrap();
        assert!(registry.get_macro("ct").is_ok());
    }

    #[test]
    fn test_unknown_library_reload() {
        let registry = MacroRegistry::new();
        assert!(matches!(
            registry.reload_library("nope"),
            Err(MacroError::UnknownMacroLibrary(_))
        ));
    }
}
