use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::errors::{Error, Result};
use crate::events::StationEvent;
use crate::link::{LinkConfig, MessageCallback, StationLink, SubscriptionId};
use crate::model::{StationCredentials, StationId};
use crate::session::{PublishOptions, SessionFactory};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConnectSummary {
    pub connected: Vec<StationId>,
    pub failed: Vec<(StationId, String)>,
}

/// Owns every station link and re-emits their events tagged with the
/// station they came from.
pub struct LinkRegistry {
    links: RwLock<HashMap<StationId, Arc<StationLink>>>,
    factory: Arc<dyn SessionFactory>,
    config: LinkConfig,
    events: broadcast::Sender<StationEvent>,
}

impl LinkRegistry {
    pub fn new(factory: Arc<dyn SessionFactory>, config: LinkConfig, capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            links: RwLock::new(HashMap::new()),
            factory,
            config,
            events,
        }
    }

    pub fn events(&self) -> broadcast::Receiver<StationEvent> {
        self.events.subscribe()
    }

    /// Creates a link for the station. Returns `false` without touching the
    /// existing link when the station is already registered.
    pub async fn add_station(&self, credentials: StationCredentials) -> bool {
        let station_id = credentials.station_id;
        let mut links = self.links.write().await;
        if links.contains_key(&station_id) {
            warn!("Station {} already has a link, ignoring add", station_id);
            return false;
        }

        let (link, mut rx) =
            StationLink::new(credentials, Arc::clone(&self.factory), self.config.clone());
        links.insert(station_id, link);
        drop(links);

        let tx = self.events.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                // Nobody listening is not an error.
                let _ = tx.send(StationEvent { station_id, event });
            }
            debug!("Event forwarding for station {} ended", station_id);
        });

        info!("Station {} added to registry", station_id);
        true
    }

    /// Disconnects the station's link and forgets it.
    pub async fn remove_station(&self, station_id: StationId) -> Result<()> {
        let link = self
            .links
            .write()
            .await
            .remove(&station_id)
            .ok_or_else(|| Error::NotFound(format!("station {}", station_id)))?;

        if let Err(e) = link.disconnect().await {
            warn!("Station {} did not disconnect cleanly: {}", station_id, e);
        }
        info!("Station {} removed from registry", station_id);
        Ok(())
    }

    pub async fn link(&self, station_id: StationId) -> Option<Arc<StationLink>> {
        self.links.read().await.get(&station_id).cloned()
    }

    pub async fn find_by_serial(&self, serial_code: &str) -> Option<Arc<StationLink>> {
        self.links
            .read()
            .await
            .values()
            .find(|link| link.serial_code() == serial_code)
            .cloned()
    }

    pub async fn station_ids(&self) -> Vec<StationId> {
        let mut ids: Vec<StationId> = self.links.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub async fn len(&self) -> usize {
        self.links.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.links.read().await.is_empty()
    }

    pub async fn connected_count(&self) -> usize {
        self.links
            .read()
            .await
            .values()
            .filter(|link| link.is_connected())
            .count()
    }

    async fn snapshot(&self) -> Vec<Arc<StationLink>> {
        self.links.read().await.values().cloned().collect()
    }

    /// Connects every link concurrently. A station that fails is logged and
    /// reported in the summary; the others carry on.
    pub async fn connect_all(&self) -> ConnectSummary {
        let mut tasks = JoinSet::new();
        for link in self.snapshot().await {
            tasks.spawn(async move { (link.station_id(), link.connect().await) });
        }

        let mut summary = ConnectSummary::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((station_id, Ok(()))) => summary.connected.push(station_id),
                Ok((station_id, Err(e))) => {
                    error!("Failed to connect station {}: {}", station_id, e);
                    summary.failed.push((station_id, e.to_string()));
                }
                Err(e) => error!("Connect task failed: {}", e),
            }
        }

        summary.connected.sort_unstable();
        summary.failed.sort_unstable();
        info!(
            "Connected {} station(s), {} failed",
            summary.connected.len(),
            summary.failed.len()
        );
        summary
    }

    pub async fn disconnect_all(&self) {
        let mut tasks = JoinSet::new();
        for link in self.snapshot().await {
            tasks.spawn(async move { (link.station_id(), link.disconnect().await) });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((station_id, Err(e))) => {
                    warn!("Station {} did not disconnect cleanly: {}", station_id, e)
                }
                Err(e) => error!("Disconnect task failed: {}", e),
            }
        }
    }

    pub async fn subscribe(
        &self,
        station_id: StationId,
        topic: &str,
        callback: MessageCallback,
    ) -> Result<SubscriptionId> {
        let link = self
            .link(station_id)
            .await
            .ok_or_else(|| Error::NotFound(format!("station {}", station_id)))?;
        Ok(link.subscribe(topic, callback).await)
    }

    /// Publishes to one station, or to all of them when `station_id` is
    /// `None`. Returns how many links accepted the message; broadcast
    /// failures are logged per station and never fail the whole call.
    pub async fn publish<T>(
        &self,
        topic: &str,
        payload: &T,
        station_id: Option<StationId>,
        options: PublishOptions,
    ) -> Result<usize>
    where
        T: Serialize + ?Sized,
    {
        if let Some(station_id) = station_id {
            let link = self
                .link(station_id)
                .await
                .ok_or_else(|| Error::NotFound(format!("station {}", station_id)))?;
            link.publish(topic, payload, options).await?;
            return Ok(1);
        }

        let payload = serde_json::to_value(payload)?;
        let mut tasks = JoinSet::new();
        for link in self.snapshot().await {
            let topic = topic.to_string();
            let payload = payload.clone();
            tasks.spawn(async move {
                let result = link.publish(&topic, &payload, options).await;
                (link.station_id(), result)
            });
        }

        let mut delivered = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(()))) => delivered += 1,
                Ok((station_id, Err(e))) => {
                    warn!("Broadcast to station {} on {} failed: {}", station_id, topic, e)
                }
                Err(e) => error!("Publish task failed: {}", e),
            }
        }
        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::LinkEvent;
    use crate::model::{StationCertificate, StationRef};
    use crate::session::{ConnectBehaviour, MemoryFactory};
    use serde_json::json;

    fn credentials(id: StationId) -> StationCredentials {
        let pem = b"-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n".to_vec();
        StationCredentials::new(
            &StationRef {
                id,
                serial_code: format!("WS-{}", id),
                organization_id: None,
            },
            StationCertificate {
                cert_pem: pem.clone(),
                key_pem: pem.clone(),
                root_ca_pem: pem,
            },
        )
        .unwrap()
    }

    fn registry(factory: &MemoryFactory) -> LinkRegistry {
        LinkRegistry::new(Arc::new(factory.clone()), LinkConfig::default(), 64)
    }

    #[tokio::test]
    async fn test_duplicate_station_rejected() {
        let factory = MemoryFactory::new();
        let registry = registry(&factory);

        assert!(registry.add_station(credentials(1)).await);
        let first = registry.link(1).await.unwrap();
        assert!(!registry.add_station(credentials(1)).await);

        assert_eq!(registry.len().await, 1);
        assert!(Arc::ptr_eq(&first, &registry.link(1).await.unwrap()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_all_isolates_failures() {
        let factory = MemoryFactory::new();
        factory.set_behaviour(2, ConnectBehaviour::Refuse("expired certificate".into()));
        factory.set_behaviour(3, ConnectBehaviour::Silent);
        let registry = registry(&factory);
        for id in 1..=4 {
            registry.add_station(credentials(id)).await;
        }

        let summary = registry.connect_all().await;

        assert_eq!(summary.connected, vec![1, 4]);
        assert_eq!(summary.failed.len(), 2);
        assert_eq!(summary.failed[0].0, 2);
        assert_eq!(summary.failed[1].0, 3);
        assert_eq!(registry.connected_count().await, 2);
    }

    #[tokio::test]
    async fn test_targeted_publish_requires_known_station() {
        let factory = MemoryFactory::new();
        let registry = registry(&factory);
        registry.add_station(credentials(1)).await;
        registry.connect_all().await;

        let err = registry
            .publish("station/WS-9/command", &json!({}), Some(9), PublishOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        let sent = registry
            .publish("station/WS-1/command", &json!({"x": 1}), Some(1), PublishOptions::default())
            .await
            .unwrap();
        assert_eq!(sent, 1);
        assert_eq!(factory.published_to("station/WS-1/command").len(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_isolates_publish_failures() {
        let factory = MemoryFactory::new();
        let registry = registry(&factory);
        for id in 1..=3 {
            registry.add_station(credentials(id)).await;
        }
        registry.connect_all().await;
        factory.fail_publishes(2, true);

        let sent = registry
            .publish("fleet/announce", "maintenance at 02:00", None, PublishOptions::default())
            .await
            .unwrap();

        assert_eq!(sent, 2);
        let stations: Vec<StationId> = factory
            .published_to("fleet/announce")
            .iter()
            .map(|m| m.station_id)
            .collect();
        assert!(stations.contains(&1) && stations.contains(&3));
    }

    #[tokio::test]
    async fn test_events_are_tagged_with_station() {
        let factory = MemoryFactory::new();
        let registry = registry(&factory);
        let mut events = registry.events();
        registry.add_station(credentials(5)).await;
        registry.connect_all().await;

        let event = events.recv().await.unwrap();
        assert_eq!(
            event,
            StationEvent {
                station_id: 5,
                event: LinkEvent::Connected
            }
        );
    }

    #[tokio::test]
    async fn test_remove_station_disconnects() {
        let factory = MemoryFactory::new();
        let registry = registry(&factory);
        registry.add_station(credentials(2)).await;
        registry.add_station(credentials(1)).await;
        registry.connect_all().await;
        assert_eq!(registry.station_ids().await, vec![1, 2]);
        let link = registry.link(1).await.unwrap();

        registry.remove_station(1).await.unwrap();
        assert_eq!(registry.station_ids().await, vec![2]);
        registry.remove_station(2).await.unwrap();

        assert!(!link.is_connected());
        assert!(!factory.is_open(1));
        assert!(registry.is_empty().await);
        assert!(matches!(
            registry.remove_station(1).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_find_by_serial() {
        let factory = MemoryFactory::new();
        let registry = registry(&factory);
        registry.add_station(credentials(8)).await;

        assert_eq!(
            registry.find_by_serial("WS-8").await.map(|l| l.station_id()),
            Some(8)
        );
        assert!(registry.find_by_serial("WS-9").await.is_none());
        assert!(registry
            .subscribe(9, "devices/9/data", Arc::new(|_: &str, _: &crate::model::Payload| {}))
            .await
            .is_err());
    }
}
