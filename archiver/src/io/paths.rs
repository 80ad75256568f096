//! Locations of the build tool's on-disk caches.
//!
//! The home directory is looked up through [`PathResolver`] so tests can point
//! remediation at a temporary root instead of the real user caches.

use std::path::{Path, PathBuf};

/// Source of the user home directory.
pub trait PathResolver {
    /// Home directory, or `None` when it cannot be determined.
    fn home_dir(&self) -> Option<PathBuf>;
}

/// Resolver backed by the process environment.
pub struct HomePathResolver;

impl PathResolver for HomePathResolver {
    fn home_dir(&self) -> Option<PathBuf> {
        dirs::home_dir()
    }
}

/// Cache directories purged between failed attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePaths {
    /// Xcode application cache.
    pub xcode_cache: PathBuf,
    /// Swift Package Manager cache.
    pub swiftpm_cache: PathBuf,
    pub derived_data: PathBuf,
    pub build_state: PathBuf,
}

impl CachePaths {
    pub fn from_home(home: &Path) -> Self {
        let caches = home.join("Library").join("Caches");
        let xcode = home.join("Library").join("Developer").join("Xcode");
        Self {
            xcode_cache: caches.join("com.apple.dt.Xcode"),
            swiftpm_cache: caches.join("org.swift.swiftpm"),
            derived_data: xcode.join("DerivedData"),
            build_state: xcode.join("BuildState"),
        }
    }

    pub fn resolve<P: PathResolver + ?Sized>(resolver: &P) -> Option<Self> {
        resolver.home_dir().map(|home| Self::from_home(&home))
    }
}
