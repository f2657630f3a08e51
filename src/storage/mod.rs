pub mod packages;

use async_trait::async_trait;

use crate::errors::InstallError;
use crate::models::Package;

/// Persisted registry of installed packages, keyed by job name.
///
/// Every mutating call is a complete load-modify-save; implementations must
/// never expose two packages with the same job name.
#[async_trait]
pub trait PackageStore: Send + Sync {
    /// All packages in store order. A store that was never written is empty.
    async fn load_all(&self) -> Result<Vec<Package>, InstallError>;
    /// Replace the whole collection.
    async fn save(&self, packages: &[Package]) -> Result<(), InstallError>;
    async fn find(&self, job: &str) -> Result<Option<Package>, InstallError>;
    /// Replace the package for `package.job` in place, or append it.
    async fn upsert(&self, package: Package) -> Result<(), InstallError>;
    /// Remove the package for `job`, returning it if it was present.
    async fn remove(&self, job: &str) -> Result<Option<Package>, InstallError>;
}

/// Fail if two packages share a job name.
pub fn ensure_unique_jobs(packages: &[Package]) -> Result<(), InstallError> {
    let mut seen = std::collections::HashSet::new();
    for pkg in packages {
        if !seen.insert(pkg.job.as_str()) {
            return Err(InstallError::Validation(format!(
                "Duplicate package record for job '{}'",
                pkg.job
            )));
        }
    }
    Ok(())
}
