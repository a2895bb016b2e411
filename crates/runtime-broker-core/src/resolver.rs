use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::candidate::{
    build_candidate, CandidateRecord, DiscoverySnapshot, InstallDirResolver, LibraryDirResolver,
};
use crate::{BrokerKind, DiscoveryError};

/// External collaborator producing the discovery snapshot for one query.
pub trait DiscoverySource: Send + Sync {
    /// # Errors
    /// Returns [`DiscoveryError`] when the platform lookup fails; callers treat
    /// this as "nothing installed".
    fn discover(&self) -> Result<DiscoverySnapshot, DiscoveryError>;
}

impl DiscoverySource for DiscoverySnapshot {
    fn discover(&self) -> Result<DiscoverySnapshot, DiscoveryError> {
        Ok(self.clone())
    }
}

/// How one runtime is picked among same-version candidates.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(tag = "policy", content = "package_id", rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// First candidate in discovery order.
    #[default]
    FirstMatch,
    /// Only the named package; absent when it is not installed for that version.
    Preferred(String),
}

impl SelectionPolicy {
    #[must_use]
    pub fn select<'a>(
        &self,
        candidates: &'a [CandidateRecord],
        major_version: u32,
    ) -> Option<&'a CandidateRecord> {
        match self {
            Self::FirstMatch => select_first_match(candidates, major_version),
            Self::Preferred(package_id) => candidates.iter().find(|candidate| {
                candidate.major_version() == major_version
                    && candidate.package_id() == package_id.as_str()
            }),
        }
    }
}

/// Stable first-match reducer; never reorders `candidates`.
#[must_use]
pub fn select_first_match(
    candidates: &[CandidateRecord],
    major_version: u32,
) -> Option<&CandidateRecord> {
    candidates.iter().find(|candidate| candidate.major_version() == major_version)
}

/// Runtime chooser for one broker kind over its own candidate universe.
#[derive(Clone)]
pub struct Resolver {
    broker_kind: BrokerKind,
    source: Arc<dyn DiscoverySource>,
    libraries: Arc<dyn LibraryDirResolver>,
    policy: SelectionPolicy,
    proxy: Option<Arc<Resolver>>,
}

impl Debug for Resolver {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("broker_kind", &self.broker_kind)
            .field("policy", &self.policy)
            .field("proxy", &self.proxy.as_ref().map(|proxy| proxy.broker_kind))
            .finish_non_exhaustive()
    }
}

impl Resolver {
    #[must_use]
    pub fn new(broker_kind: BrokerKind, source: Arc<dyn DiscoverySource>) -> Self {
        Self {
            broker_kind,
            source,
            libraries: Arc::new(InstallDirResolver),
            policy: SelectionPolicy::FirstMatch,
            proxy: None,
        }
    }

    #[must_use]
    pub fn with_library_dirs(mut self, libraries: Arc<dyn LibraryDirResolver>) -> Self {
        self.libraries = libraries;
        self
    }

    #[must_use]
    pub fn with_policy(mut self, policy: SelectionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Consult `system`'s active runtime as one more candidate, ranked after
    /// this resolver's own candidates.
    #[must_use]
    pub fn with_proxy(mut self, system: Resolver) -> Self {
        self.proxy = Some(Arc::new(system));
        self
    }

    #[must_use]
    pub fn broker_kind(&self) -> BrokerKind {
        self.broker_kind
    }

    #[must_use]
    pub fn policy(&self) -> &SelectionPolicy {
        &self.policy
    }

    /// All valid candidates of this broker for `architecture`, in discovery order.
    #[must_use]
    pub fn candidates(&self, architecture: &str) -> Vec<CandidateRecord> {
        let snapshot = match self.source.discover() {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(
                    broker = %self.broker_kind,
                    %err,
                    "discovery failed; no candidates visible"
                );
                return Vec::new();
            }
        };

        let candidates = snapshot
            .entries()
            .filter_map(|(handle, component)| {
                build_candidate(component, handle, architecture, self.libraries.as_ref())
            })
            .map(|candidate| candidate.with_broker_kind(self.broker_kind))
            .collect::<Vec<_>>();
        debug!(
            broker = %self.broker_kind,
            architecture,
            discovered = snapshot.len(),
            valid = candidates.len(),
            "collected runtime candidates"
        );
        candidates
    }

    fn candidates_with_proxy(
        &self,
        major_version: u32,
        architecture: &str,
    ) -> Vec<CandidateRecord> {
        let mut candidates = self.candidates(architecture);
        if let Some(proxy) = &self.proxy {
            if let Some(proxied) = proxy.active_runtime(major_version, architecture) {
                candidates.push(proxied.with_broker_kind(BrokerKind::SystemProvided));
            }
        }
        candidates
    }

    /// The single active runtime for `major_version` and `architecture`, if any.
    #[must_use]
    pub fn active_runtime(
        &self,
        major_version: u32,
        architecture: &str,
    ) -> Option<CandidateRecord> {
        let candidates = self.candidates_with_proxy(major_version, architecture);
        let selected = self.policy.select(&candidates, major_version).cloned();
        if selected.is_none() {
            debug!(broker = %self.broker_kind, major_version, architecture, "no active runtime");
        }
        selected
    }

    /// The candidate of `package_id` for `major_version` and `architecture`, if any.
    #[must_use]
    pub fn find_runtime(
        &self,
        major_version: u32,
        architecture: &str,
        package_id: &str,
    ) -> Option<CandidateRecord> {
        self.candidates_with_proxy(major_version, architecture).into_iter().find(|candidate| {
            candidate.major_version() == major_version && candidate.package_id() == package_id
        })
    }
}
