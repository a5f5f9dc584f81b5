//! Satellite services attached to an instance.

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

/// Kinds of satellite services, one per plugin contributing a manifest field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    Patroni,
    PgBackRest,
    Prometheus,
    Temboard,
    Powa,
}

impl ServiceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::Patroni => "patroni",
            ServiceKind::PgBackRest => "pgbackrest",
            ServiceKind::Prometheus => "prometheus",
            ServiceKind::Temboard => "temboard",
            ServiceKind::Powa => "powa",
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Patroni membership of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Patroni {
    pub cluster: String,
    pub node: String,
    pub restapi_listen: String,
    pub configpath: PathBuf,
}

/// pgBackRest stanza of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PgBackRest {
    pub stanza: String,
    pub configpath: PathBuf,
}

/// A postgres_exporter bound to an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PostgresExporter {
    pub name: String,
    pub port: u16,
    pub configpath: PathBuf,
}

/// A temBoard agent bound to an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TemboardAgent {
    pub port: u16,
    pub configpath: PathBuf,
}

/// PoWA repository inside an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Powa {
    pub dbname: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Service {
    Patroni(Patroni),
    PgBackRest(PgBackRest),
    Prometheus(PostgresExporter),
    Temboard(TemboardAgent),
    Powa(Powa),
}

impl Service {
    pub fn kind(&self) -> ServiceKind {
        match self {
            Service::Patroni(_) => ServiceKind::Patroni,
            Service::PgBackRest(_) => ServiceKind::PgBackRest,
            Service::Prometheus(_) => ServiceKind::Prometheus,
            Service::Temboard(_) => ServiceKind::Temboard,
            Service::Powa(_) => ServiceKind::Powa,
        }
    }
}

/// Typed access to one variant of [`Service`].
pub trait SatelliteService: Sized {
    const KIND: ServiceKind;

    fn downcast(service: &Service) -> Option<&Self>;
}

impl SatelliteService for Patroni {
    const KIND: ServiceKind = ServiceKind::Patroni;

    fn downcast(service: &Service) -> Option<&Self> {
        match service {
            Service::Patroni(inner) => Some(inner),
            _ => None,
        }
    }
}

impl SatelliteService for PgBackRest {
    const KIND: ServiceKind = ServiceKind::PgBackRest;

    fn downcast(service: &Service) -> Option<&Self> {
        match service {
            Service::PgBackRest(inner) => Some(inner),
            _ => None,
        }
    }
}

impl SatelliteService for PostgresExporter {
    const KIND: ServiceKind = ServiceKind::Prometheus;

    fn downcast(service: &Service) -> Option<&Self> {
        match service {
            Service::Prometheus(inner) => Some(inner),
            _ => None,
        }
    }
}

impl SatelliteService for TemboardAgent {
    const KIND: ServiceKind = ServiceKind::Temboard;

    fn downcast(service: &Service) -> Option<&Self> {
        match service {
            Service::Temboard(inner) => Some(inner),
            _ => None,
        }
    }
}

impl SatelliteService for Powa {
    const KIND: ServiceKind = ServiceKind::Powa;

    fn downcast(service: &Service) -> Option<&Self> {
        match service {
            Service::Powa(inner) => Some(inner),
            _ => None,
        }
    }
}
