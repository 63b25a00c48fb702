use crate::catalog::Catalog;
use crate::config::Settings;
use crate::downloads::DownloadCoordinator;
use crate::installer::Installer;
use crate::registry::Registry;

#[derive(Clone)]
pub struct AppState {
    pub settings: Settings,
    pub registry: Registry,
    pub downloads: DownloadCoordinator,
    pub installer: Installer,
    pub catalog: Catalog,
}
