//! Backend target parsing and node table maintenance.

use std::sync::Arc;

use edge_gateway_sdk::{DISCOVERY_SCHEME, ServiceInstance, ServiceWatcher};
use http::uri::Authority;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::client::transport::TransportFactory;
use crate::error::GatewayError;
use crate::selector::{Node, Selector};

/// A parsed backend target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Static { address: String },
    Discovery { service: String },
}

impl Target {
    pub fn parse(raw: &str) -> Result<Self, GatewayError> {
        let invalid = |reason: &str| GatewayError::InvalidBackend {
            target: raw.to_owned(),
            reason: reason.to_owned(),
        };
        let raw_trimmed = raw.trim();
        if let Some((scheme, rest)) = raw_trimmed.split_once("://") {
            if scheme == DISCOVERY_SCHEME {
                let service = rest.trim_start_matches('/');
                if service.is_empty() {
                    return Err(invalid("missing service name"));
                }
                return Ok(Self::Discovery {
                    service: service.to_owned(),
                });
            }
            if scheme != "http" {
                return Err(invalid("only http upstreams are supported"));
            }
            return authority(rest).ok_or_else(|| invalid("malformed host:port"));
        }
        authority(raw_trimmed).ok_or_else(|| invalid("malformed host:port"))
    }
}

fn authority(rest: &str) -> Option<Target> {
    let host_port = rest.split('/').next().unwrap_or_default();
    if host_port.is_empty() {
        return None;
    }
    host_port.parse::<Authority>().ok().map(|a| Target::Static {
        address: a.as_str().to_owned(),
    })
}

/// `host:port` of the first plain HTTP endpoint an instance advertises.
pub fn instance_address(instance: &ServiceInstance) -> Option<String> {
    instance.endpoints.iter().find_map(|ep| match Target::parse(ep) {
        Ok(Target::Static { address }) => Some(address),
        _ => None,
    })
}

/// Keeps one node list per configured backend and publishes their union
/// to the selector.
pub struct NodeApplier {
    selector: Arc<dyn Selector>,
    transport: Arc<dyn TransportFactory>,
    slots: Mutex<Vec<Vec<Arc<Node>>>>,
}

impl NodeApplier {
    pub fn new(
        selector: Arc<dyn Selector>,
        transport: Arc<dyn TransportFactory>,
        backends: usize,
    ) -> Self {
        Self {
            selector,
            transport,
            slots: Mutex::new(vec![Vec::new(); backends]),
        }
    }

    /// Build (or reuse) the node for `address` in slot `slot`.
    fn node(
        &self,
        slot: usize,
        address: &str,
        weight: u32,
        service: Option<&str>,
    ) -> Result<Arc<Node>, GatewayError> {
        let existing = self.slots.lock().get(slot).and_then(|nodes| {
            nodes
                .iter()
                .find(|n| n.address() == address && n.weight() == weight)
                .cloned()
        });
        if let Some(node) = existing {
            return Ok(node);
        }
        let transport = self.transport.create(address)?;
        Ok(Arc::new(Node::new(
            address,
            weight,
            service.map(str::to_owned),
            transport,
        )))
    }

    pub fn apply_static(
        &self,
        slot: usize,
        address: &str,
        weight: u32,
    ) -> Result<(), GatewayError> {
        let node = self.node(slot, address, weight, None)?;
        self.store(slot, vec![node]);
        Ok(())
    }

    /// Replace slot `slot` with the nodes of a discovery membership list.
    pub fn apply_instances(
        &self,
        slot: usize,
        service: &str,
        weight: Option<u32>,
        instances: &[ServiceInstance],
    ) -> Result<(), GatewayError> {
        let mut nodes = Vec::with_capacity(instances.len());
        for instance in instances {
            let Some(address) = instance_address(instance) else {
                tracing::debug!(service, instance = %instance.id, "instance has no http endpoint; skipped");
                continue;
            };
            let weight = weight.or_else(|| instance.weight()).unwrap_or(1);
            nodes.push(self.node(slot, &address, weight, Some(service))?);
        }
        self.store(slot, nodes);
        Ok(())
    }

    fn store(&self, slot: usize, nodes: Vec<Arc<Node>>) {
        if let Some(entry) = self.slots.lock().get_mut(slot) {
            *entry = nodes;
        }
    }

    /// Publish the union of every slot.
    pub fn publish(&self) {
        let nodes: Vec<Arc<Node>> = self.slots.lock().iter().flatten().cloned().collect();
        self.selector.apply(nodes);
    }
}

/// Apply discovery updates for one backend slot until cancelled or the
/// watcher ends.
pub fn spawn_refresh(
    applier: Arc<NodeApplier>,
    mut watcher: Box<dyn ServiceWatcher>,
    slot: usize,
    service: String,
    weight: Option<u32>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                update = watcher.next() => match update {
                    Ok(instances) => {
                        match applier.apply_instances(slot, &service, weight, &instances) {
                            Ok(()) => {
                                applier.publish();
                                tracing::info!(service = %service, instances = instances.len(), "backend membership updated");
                            }
                            Err(err) => {
                                tracing::warn!(service = %service, error = %err, "failed to apply membership update");
                            }
                        }
                    }
                    Err(err) => {
                        tracing::warn!(service = %service, error = %err, "discovery watcher stopped");
                        break;
                    }
                },
            }
        }
        tracing::debug!(service = %service, "node refresh stopped");
    });
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::client::transport::tests::ScriptedTransport;
    use crate::random::SeededRandom;
    use crate::selector::WeightedSelector;

    #[test]
    fn parses_target_forms() {
        assert_eq!(
            Target::parse("127.0.0.1:8000").unwrap(),
            Target::Static {
                address: "127.0.0.1:8000".to_owned()
            }
        );
        assert_eq!(
            Target::parse("http://svc.local:81/ignored").unwrap(),
            Target::Static {
                address: "svc.local:81".to_owned()
            }
        );
        assert_eq!(
            Target::parse("discovery:///users").unwrap(),
            Target::Discovery {
                service: "users".to_owned()
            }
        );
    }

    #[test]
    fn rejects_bad_targets() {
        for raw in ["", "discovery:///", "https://secure:443", "grpc://x:1", "bad host:1"] {
            let err = Target::parse(raw).unwrap_err();
            assert!(matches!(err, GatewayError::InvalidBackend { .. }), "{raw}: {err}");
        }
    }

    #[test]
    fn instance_address_prefers_http_endpoints() {
        let instance = ServiceInstance {
            endpoints: vec!["grpc://10.0.0.1:9000".to_owned(), "http://10.0.0.1:8000".to_owned()],
            ..ServiceInstance::default()
        };
        assert_eq!(instance_address(&instance).as_deref(), Some("10.0.0.1:8000"));
    }

    #[test]
    fn membership_update_reuses_unchanged_nodes() {
        let selector = Arc::new(WeightedSelector::with_random(SeededRandom::from_seed(1)));
        let applier = NodeApplier::new(
            selector.clone(),
            Arc::new(ScriptedTransport::default()),
            2,
        );
        applier.apply_static(0, "127.0.0.1:1", 1).unwrap();
        applier
            .apply_instances(1, "users", None, &[ServiceInstance::new("a", "http://10.0.0.1:80")])
            .unwrap();
        applier.publish();
        let before = selector.nodes();
        assert_eq!(before.len(), 2);

        applier
            .apply_instances(
                1,
                "users",
                None,
                &[
                    ServiceInstance::new("a", "http://10.0.0.1:80"),
                    ServiceInstance::new("b", "http://10.0.0.2:80"),
                ],
            )
            .unwrap();
        applier.publish();
        let after = selector.nodes();
        assert_eq!(after.len(), 3);
        assert!(Arc::ptr_eq(&before[1], &after[1]));
        assert_eq!(after[2].service(), Some("users"));
    }
}
