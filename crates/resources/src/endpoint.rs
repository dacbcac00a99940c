//! Endpoint reconciler.
//!
//! Each compute unit advertises its address and target service through
//! annotations. While the unit lives its address is merged into the service's
//! Endpoints; once it is deleted and drained the address is cut.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use corral_core::{keys, Error, PassContext, PassOutcome, Result, StoreError};
use corral_engine::Handler;
use corral_store::{typed, BackingStore};
use k8s_openapi::api::core::v1::{EndpointAddress, EndpointPort, EndpointSubset, Endpoints, Pod, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointRecord {
    pub service_name: String,
    pub service_namespace: String,
    pub ips: BTreeSet<String>,
}

impl EndpointRecord {
    /// The address a unit asks for, or `None` while its annotations are incomplete.
    pub fn from_unit(unit: &Pod) -> Option<Self> {
        let ip = unit.annotations().get(keys::ENDPOINT_IP_ANNOTATION).filter(|s| !s.is_empty())?;
        let service = unit.annotations().get(keys::ENDPOINT_SERVICE_ANNOTATION).filter(|s| !s.is_empty())?;
        Some(Self {
            service_name: service.clone(),
            service_namespace: unit.namespace().unwrap_or_default(),
            ips: BTreeSet::from([ip.clone()]),
        })
    }

    /// Addresses currently listed on a stored Endpoints object.
    pub fn from_endpoints(ep: &Endpoints) -> Self {
        let ips = ep
            .subsets
            .iter()
            .flatten()
            .flat_map(|s| s.addresses.iter().flatten())
            .map(|a| a.ip.clone())
            .collect();
        Self { service_name: ep.name_any(), service_namespace: ep.namespace().unwrap_or_default(), ips }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointPhase {
    AnnotationMissing,
    DrainPending,
    Converging(EndpointRecord),
    Cutting(EndpointRecord),
}

pub fn phase(pass: &PassContext, unit: &Pod) -> EndpointPhase {
    let Some(record) = EndpointRecord::from_unit(unit) else {
        return EndpointPhase::AnnotationMissing;
    };
    if !pass.deleting {
        return EndpointPhase::Converging(record);
    }
    let drained = unit.annotations().get(keys::DRAINED_ANNOTATION).map(|v| v == "true").unwrap_or(false);
    if drained { EndpointPhase::Cutting(record) } else { EndpointPhase::DrainPending }
}

/// `current` without the addresses in `cut`; `None` means nothing is left.
pub fn cut_addresses(current: &EndpointRecord, cut: &EndpointRecord) -> Option<BTreeSet<String>> {
    let remainder: BTreeSet<String> = current.ips.difference(&cut.ips).cloned().collect();
    if remainder.is_empty() { None } else { Some(remainder) }
}

fn ports_of(service: &Service) -> Vec<EndpointPort> {
    service
        .spec
        .as_ref()
        .and_then(|s| s.ports.clone())
        .unwrap_or_default()
        .into_iter()
        .map(|p| EndpointPort { name: p.name, port: p.port, protocol: p.protocol, app_protocol: p.app_protocol })
        .collect()
}

fn subsets(ips: &BTreeSet<String>, ports: Vec<EndpointPort>) -> Vec<EndpointSubset> {
    vec![EndpointSubset {
        addresses: Some(ips.iter().map(|ip| EndpointAddress { ip: ip.clone(), ..Default::default() }).collect()),
        ports: Some(ports),
        ..Default::default()
    }]
}

fn existing_ports(ep: &Endpoints) -> Vec<EndpointPort> {
    ep.subsets.iter().flatten().find_map(|s| s.ports.clone()).unwrap_or_default()
}

pub struct EndpointReconciler {
    store: Arc<dyn BackingStore>,
}

impl EndpointReconciler {
    pub fn new(store: Arc<dyn BackingStore>) -> Self { Self { store } }

    async fn converge(&self, desired: &EndpointRecord) -> Result<PassOutcome> {
        let store = self.store.as_ref();
        let ns = Some(desired.service_namespace.as_str());
        let Some(service) = typed::get_opt::<Service>(store, ns, &desired.service_name).await? else {
            debug!(service = %desired.service_name, namespace = %desired.service_namespace, "service not found yet");
            return Ok(PassOutcome::cancel());
        };
        match typed::get_opt::<Endpoints>(store, ns, &desired.service_name).await? {
            None => {
                let ep = Endpoints {
                    metadata: ObjectMeta {
                        name: Some(desired.service_name.clone()),
                        namespace: Some(desired.service_namespace.clone()),
                        labels: service.metadata.labels.clone(),
                        ..Default::default()
                    },
                    subsets: Some(subsets(&desired.ips, ports_of(&service))),
                };
                match typed::create(store, &ep).await {
                    Ok(_) => info!(service = %desired.service_name, ips = ?desired.ips, "endpoints created"),
                    Err(Error::Store(StoreError::AlreadyExists(_))) => {
                        debug!(service = %desired.service_name, "endpoints appeared concurrently; next pass merges");
                        return Err(StoreError::Conflict(format!("endpoints {} created concurrently", desired.service_name)).into());
                    }
                    Err(e) => return Err(e),
                }
            }
            Some(mut ep) => {
                let current = EndpointRecord::from_endpoints(&ep);
                if desired.ips.is_subset(&current.ips) {
                    return Ok(PassOutcome::proceed());
                }
                let merged: BTreeSet<String> = current.ips.union(&desired.ips).cloned().collect();
                let mut ports = existing_ports(&ep);
                if ports.is_empty() {
                    ports = ports_of(&service);
                }
                ep.subsets = Some(subsets(&merged, ports));
                typed::update(store, &ep).await?;
                info!(service = %desired.service_name, ips = ?merged, "endpoints extended");
            }
        }
        Ok(PassOutcome::proceed())
    }

    async fn cut(&self, cut: &EndpointRecord) -> Result<PassOutcome> {
        let store = self.store.as_ref();
        let ns = Some(cut.service_namespace.as_str());
        let Some(mut ep) = typed::get_opt::<Endpoints>(store, ns, &cut.service_name).await? else {
            return Ok(PassOutcome::proceed());
        };
        let current = EndpointRecord::from_endpoints(&ep);
        match cut_addresses(&current, cut) {
            None => match typed::delete::<Endpoints>(store, ns, &cut.service_name).await {
                Ok(()) => info!(service = %cut.service_name, "endpoints deleted"),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            },
            Some(remainder) if remainder == current.ips => {}
            Some(remainder) => {
                let ports = existing_ports(&ep);
                ep.subsets = Some(subsets(&remainder, ports));
                typed::update(store, &ep).await?;
                info!(service = %cut.service_name, ips = ?remainder, "endpoints cut");
            }
        }
        Ok(PassOutcome::proceed())
    }
}

#[async_trait]
impl Handler<Pod> for EndpointReconciler {
    fn name(&self) -> &str { "endpoint" }

    async fn ensure_created(&self, pass: &PassContext, unit: &Pod) -> Result<PassOutcome> {
        match phase(pass, unit) {
            EndpointPhase::Converging(record) => self.converge(&record).await,
            other => {
                debug!(unit = %unit.name_any(), phase = ?other, "endpoint precondition not met");
                Ok(PassOutcome::cancel())
            }
        }
    }

    async fn ensure_deleted(&self, pass: &PassContext, unit: &Pod) -> Result<PassOutcome> {
        match phase(pass, unit) {
            EndpointPhase::Cutting(record) => self.cut(&record).await,
            EndpointPhase::DrainPending => {
                debug!(unit = %unit.name_any(), "waiting for drain before cutting endpoint");
                Ok(PassOutcome::cancel_and_keep_finalizer())
            }
            other => {
                debug!(unit = %unit.name_any(), phase = ?other, "nothing to cut");
                Ok(PassOutcome::cancel())
            }
        }
    }
}
