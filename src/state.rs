//! Application state: every component wired to one config and event bus

use std::sync::Arc;

use anyhow::Context;

use crate::backend::BackendRegistry;
use crate::config::LauncherConfig;
use crate::events::EventBus;
use crate::launcher::Launcher;
use crate::model::ModelResolver;
use crate::proxy::LocalProxy;
use crate::release::ReleaseInstaller;
use crate::settings::{JsonSettingsStore, SettingsStore, DEBUG_OUTPUT_KEY};
use crate::tunnel::TunnelManager;

pub struct AppState {
    pub config: LauncherConfig,
    pub events: EventBus,
    pub settings: Arc<dyn SettingsStore>,
    pub registry: Arc<BackendRegistry>,
    pub installer: ReleaseInstaller,
    pub resolver: Arc<ModelResolver>,
    pub proxy: Arc<LocalProxy>,
    pub tunnel: Arc<TunnelManager>,
    pub launcher: Launcher,
}

impl AppState {
    pub fn new(config: LauncherConfig) -> anyhow::Result<Self> {
        let settings = JsonSettingsStore::open(config.settings_path.clone())
            .with_context(|| format!("Failed to open settings at {}", config.settings_path.display()))?;

        Self::with_settings(config, Arc::new(settings))
    }

    pub fn with_settings(mut config: LauncherConfig, settings: Arc<dyn SettingsStore>) -> anyhow::Result<Self> {
        config.debug_output = config.debug_output || settings.get_bool_setting(DEBUG_OUTPUT_KEY, false);
        let events = EventBus::new();

        let registry = Arc::new(BackendRegistry::new(
            config.install_dir.clone(),
            settings.clone(),
            events.clone(),
            config.version_timeout,
        ));
        let installer = ReleaseInstaller::new(registry.clone(), events.clone(), config.unpack_timeout)?;
        let resolver = Arc::new(ModelResolver::new(config.models_dir(), events.clone())?);
        let proxy = Arc::new(LocalProxy::new(config.proxy_port)?);

        let mut tunnel = TunnelManager::new(
            config.install_dir.clone(),
            events.clone(),
            config.tunnel_target_timeout,
            config.tunnel_url_timeout,
        )?;
        if let Some(binary) = &config.tunnel_binary {
            tunnel = tunnel.with_binary(binary.clone());
        }
        let tunnel = Arc::new(tunnel);

        let launcher = Launcher::new(
            config.clone(),
            registry.clone(),
            resolver.clone(),
            proxy.clone(),
            tunnel.clone(),
            events.clone(),
        );

        log::info!("Using install directory {}", config.install_dir.display());

        Ok(Self {
            config,
            events,
            settings,
            registry,
            installer,
            resolver,
            proxy,
            tunnel,
            launcher,
        })
    }
}
