// Handler module registry
// Name-keyed lookup for icon, key, LCD and knob handler factories

use std::path::Path;
use std::sync::Arc;

use libloading::{Library, Symbol};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{info, warn};

use super::{Field, IconHandler, KeyHandler, KnobHandler};
use crate::error::DaemonError;

/// Version a dynamically loaded module must export as `DECKD_MODULE_ABI`
pub const MODULE_ABI_VERSION: u32 = 1;

/// Symbol returning the module description
const MODULE_SYMBOL: &[u8] = b"deckd_module";
const ABI_SYMBOL: &[u8] = b"DECKD_MODULE_ABI";

pub type IconFactory = fn() -> Arc<dyn IconHandler>;
pub type KeyFactory = fn() -> Arc<dyn KeyHandler>;
pub type KnobFactory = fn() -> Arc<dyn KnobHandler>;

/// A named set of handler factories plus the fields they accept
///
/// A shared library provides one by exporting
/// `#[no_mangle] pub static DECKD_MODULE_ABI: u32` and
/// `#[no_mangle] pub fn deckd_module() -> Module`, built against the same
/// deckd version and toolchain as the daemon.
#[derive(Clone, Default)]
pub struct Module {
    pub name: String,
    pub new_icon: Option<IconFactory>,
    pub new_key: Option<KeyFactory>,
    pub new_lcd: Option<IconFactory>,
    pub new_knob: Option<KnobFactory>,
    pub icon_fields: Vec<Field>,
    pub key_fields: Vec<Field>,
    pub lcd_fields: Vec<Field>,
    pub knob_fields: Vec<Field>,
}

impl Module {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn info(&self) -> ModuleInfo {
        ModuleInfo {
            name: self.name.clone(),
            icon_fields: self.icon_fields.clone(),
            key_fields: self.key_fields.clone(),
            lcd_fields: self.lcd_fields.clone(),
            knob_fields: self.knob_fields.clone(),
            is_icon: self.new_icon.is_some(),
            is_key: self.new_key.is_some(),
            is_lcd: self.new_lcd.is_some(),
            is_knob: self.new_knob.is_some(),
        }
    }
}

/// Serializable module description for clients
#[derive(Debug, Clone, Serialize)]
pub struct ModuleInfo {
    pub name: String,
    pub icon_fields: Vec<Field>,
    pub key_fields: Vec<Field>,
    pub lcd_fields: Vec<Field>,
    pub knob_fields: Vec<Field>,
    pub is_icon: bool,
    pub is_key: bool,
    pub is_lcd: bool,
    pub is_knob: bool,
}

/// Registry of handler modules
pub struct ModuleRegistry {
    modules: RwLock<Vec<Arc<Module>>>,
    /// Loaded libraries stay mapped for the life of the registry
    libraries: Mutex<Vec<Library>>,
}

impl ModuleRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            modules: RwLock::new(Vec::new()),
            libraries: Mutex::new(Vec::new()),
        }
    }

    /// Create a registry with the built-in modules pre-loaded
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.load_builtins();
        registry
    }

    pub fn load_builtins(&self) {
        self.register(super::builtin::time::module());
        self.register(super::builtin::counter::module());
        self.register(super::builtin::gif::module());
    }

    /// Register a module; a second module with the same name is ignored
    pub fn register(&self, module: Module) -> bool {
        let mut modules = self.modules.write();
        if modules.iter().any(|m| m.name == module.name) {
            info!("Module already loaded: {}", module.name);
            return false;
        }
        info!("Loaded module {}", module.name);
        modules.push(Arc::new(module));
        true
    }

    pub fn get(&self, name: &str) -> Option<Arc<Module>> {
        self.modules.read().iter().find(|m| m.name == name).cloned()
    }

    pub fn new_icon(&self, name: &str) -> Option<Arc<dyn IconHandler>> {
        self.get(name)?.new_icon.map(|f| f())
    }

    pub fn new_key(&self, name: &str) -> Option<Arc<dyn KeyHandler>> {
        self.get(name)?.new_key.map(|f| f())
    }

    pub fn new_lcd(&self, name: &str) -> Option<Arc<dyn IconHandler>> {
        self.get(name)?.new_lcd.map(|f| f())
    }

    pub fn new_knob(&self, name: &str) -> Option<Arc<dyn KnobHandler>> {
        self.get(name)?.new_knob.map(|f| f())
    }

    pub fn list(&self) -> Vec<ModuleInfo> {
        self.modules.read().iter().map(|m| m.info()).collect()
    }

    pub fn len(&self) -> usize {
        self.modules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.read().is_empty()
    }

    /// Load a module from a shared library
    pub fn load_library<P: AsRef<Path>>(&self, path: P) -> Result<(), DaemonError> {
        let path = path.as_ref();
        let load_err = |reason: String| DaemonError::ModuleLoad {
            path: path.display().to_string(),
            reason,
        };

        let library = unsafe { Library::new(path) }.map_err(|e| load_err(e.to_string()))?;

        let abi = unsafe {
            let symbol: Symbol<'_, *const u32> = library
                .get(ABI_SYMBOL)
                .map_err(|e| load_err(format!("missing ABI version: {e}")))?;
            **symbol
        };
        if abi != MODULE_ABI_VERSION {
            return Err(DaemonError::AbiMismatch {
                expected: MODULE_ABI_VERSION,
                actual: abi,
            });
        }

        let module = unsafe {
            let constructor: Symbol<'_, fn() -> Module> = library
                .get(MODULE_SYMBOL)
                .map_err(|e| load_err(format!("missing module constructor: {e}")))?;
            constructor()
        };

        self.register(module);
        self.libraries.lock().push(library);
        Ok(())
    }

    /// Load every listed library, logging failures. Returns how many loaded.
    pub fn load_all(&self, paths: &[String]) -> usize {
        let mut count = 0;
        for path in paths {
            match self.load_library(path) {
                Ok(()) => count += 1,
                Err(e) => warn!("Failed to load module: {}", e),
            }
        }
        count
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
