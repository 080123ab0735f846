use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use rand::Rng as _;

use crate::error::IdentityError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// 1-based, unique per run.
    pub client_index: u64,
    pub charge_point_id: String,
    pub shared_secret: Arc<str>,
}

impl Identity {
    pub fn credential(&self) -> String {
        encode_credential(&self.charge_point_id, &self.shared_secret)
    }

    pub fn authorization_header(&self) -> String {
        format!("Basic {}", self.credential())
    }
}

/// `base64(id ":" secret)`, standard alphabet with padding.
pub fn encode_credential(charge_point_id: &str, secret: &str) -> String {
    STANDARD.encode(format!("{charge_point_id}:{secret}"))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum PoolSampling {
    /// Client `i` takes `pool[(i - 1) % len]`.
    #[default]
    RoundRobin,
    Random,
}

#[derive(Debug, Clone)]
enum Source {
    Derived { prefix: String, width: usize },
    Pool {
        ids: Arc<[String]>,
        sampling: PoolSampling,
    },
}

/// Maps client indices to charge point identities.
///
/// Derived mode is collision-free. Pool mode deliberately lets several clients
/// claim the same identity, which is how contention on one id is modelled.
#[derive(Debug, Clone)]
pub struct IdentityProvider {
    source: Source,
    secret: Arc<str>,
}

impl IdentityProvider {
    pub fn derived(
        prefix: impl Into<String>,
        width: usize,
        secret: impl AsRef<str>,
    ) -> Result<Self, IdentityError> {
        if width == 0 {
            return Err(IdentityError::ZeroWidth);
        }
        Ok(Self {
            source: Source::Derived {
                prefix: prefix.into(),
                width,
            },
            secret: secret_from(secret.as_ref())?,
        })
    }

    pub fn pool(
        ids: Vec<String>,
        sampling: PoolSampling,
        secret: impl AsRef<str>,
    ) -> Result<Self, IdentityError> {
        if ids.is_empty() {
            return Err(IdentityError::EmptyPool);
        }
        if let Some(idx) = ids.iter().position(|id| id.trim().is_empty()) {
            return Err(IdentityError::EmptyPoolEntry(idx));
        }
        Ok(Self {
            source: Source::Pool {
                ids: ids.into(),
                sampling,
            },
            secret: secret_from(secret.as_ref())?,
        })
    }

    pub fn identity_for(&self, client_index: u64) -> Identity {
        let charge_point_id = match &self.source {
            Source::Derived { prefix, width } => format!("{prefix}{client_index:0width$}"),
            Source::Pool { ids, sampling } => {
                let len = ids.len() as u64;
                let slot = match sampling {
                    PoolSampling::RoundRobin => client_index.saturating_sub(1) % len,
                    PoolSampling::Random => rand::rng().random_range(0..len),
                };
                ids[slot as usize].clone()
            }
        };

        Identity {
            client_index,
            charge_point_id,
            shared_secret: self.secret.clone(),
        }
    }

    pub fn is_deterministic(&self) -> bool {
        !matches!(
            self.source,
            Source::Pool {
                sampling: PoolSampling::Random,
                ..
            }
        )
    }
}

fn secret_from(secret: &str) -> Result<Arc<str>, IdentityError> {
    if secret.is_empty() {
        return Err(IdentityError::EmptySecret);
    }
    Ok(Arc::from(secret))
}
