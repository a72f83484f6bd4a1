pub mod command;
pub mod fs;
pub mod gateway;
pub mod logger;
pub mod tasks;

pub use command::CommandHandler;
pub use fs::FsModule;
pub use gateway::GatewayServer;
pub use logger::LoggerModule;
pub use tasks::TaskManager;

use crate::config::Settings;
use crate::module::{ModuleFactory, ModuleLoader};

/// Modules every core runs, in registration order.
pub fn builtin_modules() -> Vec<ModuleFactory> {
    vec![
        ModuleFactory::new(logger::NAME, |ctx| Ok(Box::new(LoggerModule::new(ctx)))),
        ModuleFactory::new(command::NAME, |ctx| Ok(Box::new(CommandHandler::new(ctx)))),
        ModuleFactory::new(gateway::NAME, |ctx| Ok(Box::new(GatewayServer::new(ctx)))),
        ModuleFactory::new(tasks::NAME, |ctx| Ok(Box::new(TaskManager::new(ctx)))),
    ]
}

/// Loads the optional modules listed in `modules.enabled`.
pub struct OptionalModules;

impl OptionalModules {
    fn catalogue() -> Vec<ModuleFactory> {
        vec![ModuleFactory::new(fs::NAME, |ctx| Ok(Box::new(FsModule::new(ctx))))]
    }
}

impl ModuleLoader for OptionalModules {
    fn discover(&self, settings: &Settings) -> Vec<ModuleFactory> {
        let catalogue = Self::catalogue();
        for name in &settings.modules.enabled {
            if !catalogue.iter().any(|f| f.name == name.as_str()) {
                tracing::warn!(module = %name, "enabled module is not available");
            }
        }
        catalogue
            .into_iter()
            .filter(|factory| settings.is_enabled(factory.name))
            .collect()
    }
}
