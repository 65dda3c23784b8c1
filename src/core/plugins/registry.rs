use std::{collections::BTreeMap, sync::Arc};

use serde_json::Value;

use super::{
    error::{PluginError, PluginResult},
    traits::{Construct, Plugin},
};
use crate::core::metrics::Registry;

/// Function that builds one plugin instance from its configuration object.
pub type PluginFactory = fn(&Value, &Arc<Registry>) -> PluginResult<Arc<dyn Plugin>>;

/// Metadata for a single plugin submitted to the global inventory.
pub struct PluginMeta {
    pub name: &'static str,
    pub factory: PluginFactory,
}

inventory::collect!(PluginMeta);

/// Generic factory body used by `register_plugin!`.
pub fn construct_dyn<T: Construct>(
    config: &Value,
    registry: &Arc<Registry>,
) -> PluginResult<Arc<dyn Plugin>> {
    Ok(Arc::new(T::construct(config, registry)?))
}

/// Lookup table from case-normalized plugin name to factory.
#[derive(Clone, Default)]
pub struct PluginTable {
    factories: BTreeMap<String, PluginFactory>,
}

impl PluginTable {
    /// Empty table; fill it with [`PluginTable::register`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Table of every plugin compiled into the binary.
    pub fn builtin() -> Self {
        let mut table = Self::new();
        for meta in inventory::iter::<PluginMeta> {
            table.register(meta.name, meta.factory);
        }
        table
    }

    pub fn register(&mut self, name: &str, factory: PluginFactory) {
        self.factories.insert(name.to_lowercase(), factory);
    }

    /// Looks up a factory, ignoring the case of `name`.
    pub fn get(&self, name: &str) -> PluginResult<PluginFactory> {
        self.factories
            .get(&name.to_lowercase())
            .copied()
            .ok_or_else(|| PluginError::PluginNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(&name.to_lowercase())
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

/// Registers a plugin type implementing `Construct` under the given name.
#[macro_export]
macro_rules! register_plugin {
    ($plugin_type:ty, $name:expr) => {
        inventory::submit! {
            $crate::core::plugins::registry::PluginMeta {
                name: $name,
                factory: $crate::core::plugins::registry::construct_dyn::<$plugin_type>,
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy;

    impl Plugin for Dummy {
        fn name(&self) -> &'static str {
            "dummy"
        }
    }

    impl Construct for Dummy {
        fn construct(_config: &Value, _registry: &Arc<Registry>) -> PluginResult<Self> {
            Ok(Dummy)
        }
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let mut table = PluginTable::new();
        table.register("Dummy", construct_dyn::<Dummy>);

        assert_eq!(table.len(), 1);
        assert!(table.contains("DUMMY"));
        assert_eq!(table.names(), vec!["dummy"]);

        let factory = table.get("dUmMy").expect("dummy should be registered");
        let plugin = factory(&Value::Null, &Arc::new(Registry::new())).unwrap();
        assert_eq!(plugin.name(), "dummy");
        assert!(plugin.as_collect().is_none());
        assert!(plugin.as_update().is_none());
    }

    #[test]
    fn missing_plugin_is_reported() {
        let table = PluginTable::new();
        assert!(table.is_empty());
        assert!(matches!(
            table.get("nope"),
            Err(PluginError::PluginNotFound(name)) if name == "nope"
        ));
    }

    #[test]
    fn builtin_table_contains_shipped_plugins() {
        let table = PluginTable::builtin();
        for name in [
            "system",
            "loadavg",
            "meminfo",
            "filesystem",
            "netdev",
            "netdevexists",
            "ping",
            "mcu",
            "lmsensors",
            "imx28",
        ] {
            assert!(table.contains(name), "{} should be registered", name);
        }
    }

    mod macro_tests {
        use super::*;
        #[allow(unused_imports)]
        use crate::register_plugin;

        struct MacroTestPlugin;

        impl Plugin for MacroTestPlugin {
            fn name(&self) -> &'static str {
                "macro_test"
            }
        }

        impl Construct for MacroTestPlugin {
            fn construct(_config: &Value, _registry: &Arc<Registry>) -> PluginResult<Self> {
                Ok(MacroTestPlugin)
            }
        }

        register_plugin!(MacroTestPlugin, "macro_test");

        #[test]
        fn register_plugin_macro_submits_to_inventory() {
            assert!(PluginTable::builtin().contains("macro_test"));
        }
    }
}
