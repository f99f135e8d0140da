//! Provider selection from host facts.
//!
//! The registry maps each resource kind to a selector function; selectors
//! inspect facts and return the provider module for that host, or an
//! `unsupported OS` error. This keeps the provider set open: registering
//! a new kind is one entry, no ambient loading involved.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::ProviderError;
use crate::facts::Facts;

use super::providers::{
    DarwinAccountProvider, ExecProvider, LaunchdProvider, LinuxAccountProvider, PackageManager,
    PackageProvider, Provider, SystemdProvider, UnixFsProvider,
};
use super::ResourceKind;

/// Picks the provider for one resource kind on one host.
pub type Selector = fn(&Facts) -> Result<Arc<dyn Provider>, ProviderError>;

/// Kind-name to selector map.
pub struct ProviderRegistry {
    selectors: HashMap<&'static str, Selector>,
}

impl ProviderRegistry {
    /// The standard selector table.
    pub fn standard() -> Self {
        let mut selectors: HashMap<&'static str, Selector> = HashMap::new();
        selectors.insert("package", select_package);
        selectors.insert("service", select_service);
        selectors.insert("file", select_fs);
        selectors.insert("directory", select_fs);
        selectors.insert("user", select_account);
        selectors.insert("group", select_account);
        selectors.insert("exec", select_exec);
        Self { selectors }
    }

    /// Registers or replaces the selector for a kind.
    pub fn register(&mut self, kind: &'static str, selector: Selector) {
        self.selectors.insert(kind, selector);
    }

    pub fn provider_for(
        &self,
        kind: &ResourceKind,
        facts: &Facts,
    ) -> Result<Arc<dyn Provider>, ProviderError> {
        let selector = self.selectors.get(kind.kind_name()).ok_or_else(|| {
            ProviderError::UnsupportedOs {
                family: format!("no selector for kind '{}'", kind.kind_name()),
            }
        })?;
        selector(facts)
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

fn select_package(facts: &Facts) -> Result<Arc<dyn Provider>, ProviderError> {
    let manager = match facts.os_family() {
        "debian" => PackageManager::Apt,
        "rhel" => PackageManager::Yum,
        "arch" => PackageManager::Pacman,
        "darwin" => PackageManager::Brew,
        family => {
            return Err(ProviderError::UnsupportedOs {
                family: family.to_string(),
            })
        }
    };
    Ok(Arc::new(PackageProvider::new(manager)))
}

fn select_service(facts: &Facts) -> Result<Arc<dyn Provider>, ProviderError> {
    if facts.os() == "darwin" || facts.os_family() == "darwin" {
        return Ok(Arc::new(LaunchdProvider));
    }
    if facts.os() == "linux" || matches!(facts.os_family(), "debian" | "rhel" | "arch") {
        return Ok(Arc::new(SystemdProvider));
    }
    Err(ProviderError::UnsupportedOs {
        family: facts.os_family().to_string(),
    })
}

fn select_fs(facts: &Facts) -> Result<Arc<dyn Provider>, ProviderError> {
    if facts.is_unix_like() {
        Ok(Arc::new(UnixFsProvider))
    } else {
        Err(ProviderError::UnsupportedOs {
            family: facts.os_family().to_string(),
        })
    }
}

fn select_account(facts: &Facts) -> Result<Arc<dyn Provider>, ProviderError> {
    if facts.os() == "darwin" || facts.os_family() == "darwin" {
        return Ok(Arc::new(DarwinAccountProvider));
    }
    if facts.os() == "linux" || matches!(facts.os_family(), "debian" | "rhel" | "arch" | "alpine") {
        return Ok(Arc::new(LinuxAccountProvider));
    }
    Err(ProviderError::UnsupportedOs {
        family: facts.os_family().to_string(),
    })
}

fn select_exec(_facts: &Facts) -> Result<Arc<dyn Provider>, ProviderError> {
    Ok(Arc::new(ExecProvider))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{PackageResource, PackageState, ServiceResource, ServiceState};

    fn package() -> ResourceKind {
        ResourceKind::Package(PackageResource {
            name: "nginx".into(),
            state: PackageState::Installed,
        })
    }

    fn service() -> ResourceKind {
        ResourceKind::Service(ServiceResource {
            name: "nginx".into(),
            state: ServiceState::Running,
            enabled: None,
        })
    }

    #[test]
    fn test_package_selection_by_family() {
        let registry = ProviderRegistry::standard();
        for family in ["debian", "rhel", "arch", "darwin"] {
            let facts = Facts::for_os(if family == "darwin" { "darwin" } else { "linux" }, family);
            assert!(registry.provider_for(&package(), &facts).is_ok(), "{family}");
        }
    }

    #[test]
    fn test_package_unsupported_family() {
        let registry = ProviderRegistry::standard();
        let facts = Facts::for_os("freebsd", "freebsd");
        let err = registry.provider_for(&package(), &facts).unwrap_err();
        assert_eq!(err.to_string(), "unsupported OS: freebsd");
    }

    #[test]
    fn test_service_selection() {
        let registry = ProviderRegistry::standard();
        assert!(registry
            .provider_for(&service(), &Facts::for_os("linux", "debian"))
            .is_ok());
        assert!(registry
            .provider_for(&service(), &Facts::for_os("darwin", "darwin"))
            .is_ok());
        assert!(registry
            .provider_for(&service(), &Facts::for_os("openbsd", "unknown"))
            .is_err());
    }

    #[test]
    fn test_exec_always_supported() {
        let registry = ProviderRegistry::standard();
        let kind = ResourceKind::Exec(crate::resource::ExecResource {
            cmd: "true".into(),
            ..Default::default()
        });
        assert!(registry
            .provider_for(&kind, &Facts::for_os("unknown", "unknown"))
            .is_ok());
    }
}
