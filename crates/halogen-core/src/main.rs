use std::sync::Arc;

use halogen_core::modules::{OptionalModules, builtin_modules};
use halogen_core::{Core, CoreExit, EventBus, Settings};
use halogen_protocol::{ChainAllocator, ChainSource, ContextPolicy, Event, EventBody, PROCESS_CONTEXT};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let settings = Settings::load().inspect_err(|e| {
        tracing::error!(error = %e, "failed to load configuration");
    })?;

    let policy = settings
        .module_config("server")
        .get("context_policy", ContextPolicy::default());
    let chains: Arc<dyn ChainSource> = Arc::new(ChainAllocator::new(policy));
    let bus = Arc::new(EventBus::new());

    tracing::info!(
        user = %settings.user.name,
        dev = settings.dev.enabled,
        context_policy = policy.as_str(),
        "halogen starting"
    );

    spawn_interrupt_handler(bus.clone(), chains.clone());

    // Restarts re-read the configuration and rebuild every module.
    let mut settings = Some(settings);
    loop {
        let current = match settings.take() {
            Some(settings) => settings,
            None => Settings::load()?,
        };
        let mut core = Core::init(
            current,
            bus.clone(),
            chains.clone(),
            builtin_modules(),
            &OptionalModules,
        );

        match core.run().await {
            Ok(CoreExit::Shutdown) => break,
            Ok(CoreExit::Restart) => tracing::info!("halogen restarting"),
            Err(e) => {
                tracing::error!(error = %e, "halogen stopped on a fault");
                return Err(e.into());
            }
        }
    }

    Ok(())
}

/// Ctrl-C asks for an orderly shutdown.
fn spawn_interrupt_handler(bus: Arc<EventBus>, chains: Arc<dyn ChainSource>) {
    tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            bus.emit(Event::new(
                "signal",
                chains.next_in(PROCESS_CONTEXT),
                EventBody::Shutdown {
                    emergency: false,
                    reason: "Interrupted.".to_string(),
                },
            ));
        }
    });
}
