#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::{Arc, Mutex, RwLock};
    use std::time::Duration;

    use anyhow::Result;

    use crate::config::{Distribution, GossipSettings, TopologyIntervals};
    use crate::data::crdt::CrdtValue;
    use crate::data::store::DataStore;
    use crate::data::types::{Payload, PerNodeDatum, SharedDatum};
    use crate::error::GossipError;
    use crate::gossip::active::{
        different_datacenter, same_dc_different_rack, same_rack, select_partner,
        DatacenterRackAwareGossiper, ActiveGossiper, GossipCourier,
    };
    use crate::gossip::dispatcher::MessageDispatcher;
    use crate::gossip::engine::GossipEngine;
    use crate::gossip::messages::GossipMessage;
    use crate::gossip::worker_pool::WorkerPool;
    use crate::membership::failure_detector::FailureDetector;
    use crate::membership::table::MembershipTable;
    use crate::membership::types::{Endpoint, Member, NodeId, PeerState};
    use crate::protocol::BincodeCodec;
    use crate::time::{ManualClock, SystemClock};
    use crate::transport::Transport;

    fn member(id: &str, port: u16) -> Member {
        Member::new(
            "c",
            NodeId(id.to_string()),
            Endpoint::udp("127.0.0.1", port),
            BTreeMap::new(),
        )
    }

    fn tagged_member(id: &str, port: u16, dc: &str, rack: &str) -> Member {
        let mut properties = BTreeMap::new();
        properties.insert("datacenter".to_string(), dc.to_string());
        properties.insert("rack".to_string(), rack.to_string());
        Member::new(
            "c",
            NodeId(id.to_string()),
            Endpoint::udp("127.0.0.1", port),
            properties,
        )
    }

    // ============================================================
    // DISPATCHER
    // ============================================================

    fn dispatcher_fixture() -> (
        Arc<MembershipTable>,
        Arc<DataStore>,
        Arc<ManualClock>,
        Arc<MessageDispatcher>,
    ) {
        let local = member("local", 5000);
        let detector = Arc::new(FailureDetector::new(100, 3, Distribution::Exponential));
        let table = MembershipTable::new(&local, detector);
        let clock = Arc::new(ManualClock::new(0, 1_000));
        let store = DataStore::new(clock.clone());
        let dispatcher = MessageDispatcher::new(
            table.clone(),
            store.clone(),
            clock.clone(),
            NodeId("local".to_string()),
        );
        (table, store, clock, dispatcher)
    }

    #[test]
    fn test_membership_list_upserts_sender_and_learned_members() {
        let (table, _store, _clock, dispatcher) = dispatcher_fixture();
        let mut sender = member("sender", 5001);
        sender.heartbeat = 10;
        let mut learned = member("learned", 5002);
        learned.heartbeat = 4;

        dispatcher.dispatch(GossipMessage::MembershipList {
            from: sender.clone(),
            members: vec![learned],
        });

        assert_eq!(table.snapshot_all().len(), 2);
        assert_eq!(table.heartbeat_of(&sender.id), Some(10));
        assert_eq!(table.heartbeat_of(&NodeId("learned".to_string())), Some(4));
    }

    #[test]
    fn test_membership_list_ignores_own_id() {
        let (table, _store, _clock, dispatcher) = dispatcher_fixture();
        let mut echo = member("local", 5000);
        echo.heartbeat = 999;

        dispatcher.dispatch(GossipMessage::MembershipList {
            from: echo.clone(),
            members: vec![echo],
        });

        assert!(table.snapshot_all().is_empty());
    }

    #[test]
    fn test_membership_list_keeps_heartbeats_monotonic() {
        let (table, _store, _clock, dispatcher) = dispatcher_fixture();
        let peer_id = NodeId("sender".to_string());
        for hb in [5i64, 9, 2, 9, 14] {
            let mut sender = member("sender", 5001);
            sender.heartbeat = hb;
            dispatcher.dispatch(GossipMessage::MembershipList {
                from: sender,
                members: vec![],
            });
        }
        assert_eq!(table.heartbeat_of(&peer_id), Some(14));
    }

    #[test]
    fn test_data_messages_land_in_store() {
        let (_table, store, _clock, dispatcher) = dispatcher_fixture();

        dispatcher.dispatch(GossipMessage::PerNodeData(PerNodeDatum {
            node_id: NodeId("n1".to_string()),
            key: "k".to_string(),
            timestamp: 100,
            expire_at: None,
            payload: Payload::Text("v".to_string()),
        }));
        dispatcher.dispatch(GossipMessage::SharedData(SharedDatum {
            key: "s".to_string(),
            node_id: NodeId("n1".to_string()),
            timestamp: 100,
            expire_at: None,
            payload: Payload::Text("w".to_string()),
        }));

        assert!(store.find_per_node(&NodeId("n1".to_string()), "k").is_some());
        assert!(store.find_shared("s").is_some());
    }

    #[test]
    fn test_shutdown_message_forces_peer_down() {
        let (table, _store, _clock, dispatcher) = dispatcher_fixture();
        let mut peer = member("peer", 5001);
        peer.heartbeat = 1;
        dispatcher.dispatch(GossipMessage::MembershipList {
            from: peer.clone(),
            members: vec![],
        });
        table.set_state(&peer.id, PeerState::Up);
        assert_eq!(table.snapshot_live().len(), 1);

        dispatcher.dispatch(GossipMessage::Shutdown {
            node_id: peer.id.clone(),
        });
        assert!(table.snapshot_live().is_empty());
        assert_eq!(table.snapshot_dead().len(), 1);
    }

    // ============================================================
    // TOPOLOGY FILTERING
    // ============================================================

    #[test]
    fn test_same_rack_excludes_other_racks_and_dcs() {
        let local = tagged_member("local", 5000, "dc1", "r1");
        let live = vec![
            tagged_member("a", 5001, "dc1", "r1"),
            tagged_member("b", 5002, "dc1", "r2"),
            tagged_member("c", 5003, "dc2", "r1"),
        ];

        let rack: Vec<String> = same_rack(&local, &live).into_iter().map(|m| m.id.0).collect();
        assert_eq!(rack, vec!["a"]);

        let dc: Vec<String> = same_dc_different_rack(&local, &live)
            .into_iter()
            .map(|m| m.id.0)
            .collect();
        assert_eq!(dc, vec!["b"]);

        let remote: Vec<String> = different_datacenter(&local, &live)
            .into_iter()
            .map(|m| m.id.0)
            .collect();
        assert_eq!(remote, vec!["c"]);
    }

    #[test]
    fn test_untagged_local_member_gets_empty_tiers() {
        let local = member("local", 5000);
        let live = vec![
            tagged_member("a", 5001, "dc1", "r1"),
            tagged_member("b", 5002, "dc2", "r2"),
        ];
        assert!(same_rack(&local, &live).is_empty());
        assert!(same_dc_different_rack(&local, &live).is_empty());
        assert!(different_datacenter(&local, &live).is_empty());
    }

    #[test]
    fn test_partially_tagged_local_member_gets_empty_tiers() {
        let mut local = member("local", 5000);
        local
            .properties
            .insert("datacenter".to_string(), "dc1".to_string());
        let live = vec![tagged_member("a", 5001, "dc1", "r1")];
        assert!(same_rack(&local, &live).is_empty());
        assert!(different_datacenter(&local, &live).is_empty());
    }

    #[test]
    fn test_untagged_peers_count_as_remote_only() {
        let local = tagged_member("local", 5000, "dc1", "r1");
        let live = vec![member("plain", 5001)];
        assert!(same_rack(&local, &live).is_empty());
        assert!(same_dc_different_rack(&local, &live).is_empty());
        assert_eq!(different_datacenter(&local, &live).len(), 1);
    }

    #[test]
    fn test_select_partner_uniform_and_total() {
        assert!(select_partner(&[]).is_none());

        let candidates = vec![member("a", 1), member("b", 2), member("c", 3)];
        let mut seen = BTreeSet::new();
        for _ in 0..200 {
            seen.insert(select_partner(&candidates).unwrap().id.0);
        }
        assert_eq!(seen.len(), 3);
    }

    // ============================================================
    // TIER SEND RATES
    // ============================================================

    struct RecordingTransport {
        sends: Mutex<Vec<u16>>,
    }

    impl RecordingTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sends: Mutex::new(Vec::new()),
            })
        }

        fn counts_for(&self, port: u16) -> usize {
            self.sends.lock().unwrap().iter().filter(|&&p| p == port).count()
        }
    }

    impl Transport for RecordingTransport {
        fn start_endpoint(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async { Ok(()) })
        }

        fn send<'a>(
            &'a self,
            endpoint: &'a Endpoint,
            _bytes: Vec<u8>,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
            self.sends.lock().unwrap().push(endpoint.port);
            Box::pin(async { Ok(()) })
        }

        fn shutdown(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
            Box::pin(async {})
        }
    }

    #[tokio::test]
    async fn test_rack_tier_sends_more_often_than_remote() {
        let local = tagged_member("local", 5000, "dc1", "r1");
        let detector = Arc::new(FailureDetector::new(100, 3, Distribution::Exponential));
        let table = MembershipTable::new(&local, detector);
        // One live member per tier, distinguishable by port.
        for peer in [
            tagged_member("rackmate", 6001, "dc1", "r1"),
            tagged_member("dcmate", 6002, "dc1", "r2"),
            tagged_member("remote", 6003, "dc2", "r1"),
        ] {
            table.upsert_from_heartbeat(&peer, 1, 0);
            table.set_state(&peer.id, PeerState::Up);
        }

        let clock = Arc::new(SystemClock::new());
        let store = DataStore::new(clock.clone());
        let transport = RecordingTransport::new();
        let courier = GossipCourier::new(
            table,
            store,
            transport.clone(),
            Arc::new(BincodeCodec),
            clock,
            Arc::new(RwLock::new(local)),
        );
        let pool = WorkerPool::new(1024, 4);
        let gossiper = DatacenterRackAwareGossiper::new(
            courier,
            pool,
            TopologyIntervals {
                same_rack_ms: 20,
                same_dc_ms: 80,
                different_dc_ms: 400,
                dead_member_ms: 1000,
            },
        );

        gossiper.start();
        tokio::time::sleep(Duration::from_millis(1200)).await;
        gossiper.shutdown().await;

        let rack = transport.counts_for(6001);
        let dc = transport.counts_for(6002);
        let remote = transport.counts_for(6003);
        assert!(rack > dc, "rack {} should beat dc {}", rack, dc);
        assert!(dc > remote, "dc {} should beat remote {}", dc, remote);
        // 20 ms vs 80 ms: roughly 4x, allow generous scheduling slop.
        let ratio = rack as f64 / dc.max(1) as f64;
        assert!(
            (2.0..8.0).contains(&ratio),
            "rack:dc ratio {} out of range (rack {}, dc {})",
            ratio,
            rack,
            dc
        );
    }

    // ============================================================
    // ENGINE LIFECYCLE + API GUARDS
    // ============================================================

    fn test_settings() -> GossipSettings {
        GossipSettings {
            gossip_interval_ms: 50,
            minimum_samples: 1,
            window_size: 100,
            reaper_interval_ms: 100,
            active_gossiper: "simple".to_string(),
            ..GossipSettings::default()
        }
    }

    fn engine_on(port: u16, id: &str, seeds: Vec<Member>) -> Arc<GossipEngine> {
        GossipEngine::new(
            "test-cluster",
            NodeId(id.to_string()),
            Endpoint::udp("127.0.0.1", port),
            BTreeMap::new(),
            seeds,
            test_settings(),
        )
    }

    fn free_port() -> u16 {
        std::net::UdpSocket::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[tokio::test]
    async fn test_api_rejects_calls_before_start() {
        let engine = engine_on(0, "lonely", vec![]);
        let datum = PerNodeDatum {
            node_id: NodeId("ignored".to_string()),
            key: "k".to_string(),
            timestamp: 100,
            expire_at: None,
            payload: Payload::Text("v".to_string()),
        };
        assert!(matches!(
            engine.gossip_per_node_data(datum),
            Err(GossipError::NotRunning)
        ));
        assert!(matches!(engine.find_crdt("k"), Err(GossipError::NotRunning)));
    }

    #[tokio::test]
    async fn test_api_validates_payload_fields() {
        let engine = engine_on(0, "validator", vec![]);
        engine.start().await.unwrap();

        let no_key = PerNodeDatum {
            node_id: NodeId("x".to_string()),
            key: String::new(),
            timestamp: 100,
            expire_at: None,
            payload: Payload::Text("v".to_string()),
        };
        assert!(matches!(
            engine.gossip_per_node_data(no_key),
            Err(GossipError::InvalidPayload(_))
        ));

        let no_timestamp = SharedDatum {
            key: "k".to_string(),
            node_id: NodeId("x".to_string()),
            timestamp: 0,
            expire_at: None,
            payload: Payload::Text("v".to_string()),
        };
        assert!(matches!(
            engine.gossip_shared_data(no_timestamp),
            Err(GossipError::InvalidPayload(_))
        ));

        let not_a_crdt = SharedDatum {
            key: "k".to_string(),
            node_id: NodeId("x".to_string()),
            timestamp: 100,
            expire_at: None,
            payload: Payload::Text("v".to_string()),
        };
        assert!(matches!(
            engine.merge(not_a_crdt),
            Err(GossipError::InvalidPayload(_))
        ));

        engine.stop().await;
    }

    #[tokio::test]
    async fn test_gossip_data_is_stamped_with_local_id() {
        let engine = engine_on(0, "stamper", vec![]);
        engine.start().await.unwrap();

        engine
            .gossip_per_node_data(PerNodeDatum {
                node_id: NodeId("spoofed".to_string()),
                key: "k".to_string(),
                timestamp: 100,
                expire_at: None,
                payload: Payload::Text("v".to_string()),
            })
            .unwrap();

        let stamped = engine
            .find_per_node_gossip_data(&NodeId("stamper".to_string()), "k")
            .unwrap();
        assert!(stamped.is_some());
        assert!(engine
            .find_per_node_gossip_data(&NodeId("spoofed".to_string()), "k")
            .unwrap()
            .is_none());

        engine.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_api_goes_dark() {
        let engine = engine_on(0, "stopper", vec![]);
        engine.start().await.unwrap();
        engine.stop().await;
        engine.stop().await;

        assert!(matches!(engine.find_crdt("k"), Err(GossipError::NotRunning)));
    }

    #[tokio::test]
    async fn test_start_fails_cleanly_on_unknown_transport() {
        let mut settings = test_settings();
        settings.transport = "carrier-pigeon".to_string();
        let engine = GossipEngine::new(
            "test-cluster",
            NodeId("grounded".to_string()),
            Endpoint::udp("127.0.0.1", 0),
            BTreeMap::new(),
            vec![],
            settings,
        );
        assert!(matches!(
            engine.start().await,
            Err(GossipError::TransportUnavailable(_))
        ));
    }

    // ============================================================
    // TWO-NODE SCENARIOS (real UDP on loopback)
    // ============================================================

    async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while !condition() {
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for {}", what);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[tokio::test]
    async fn test_two_node_bootstrap_and_crdt_convergence() {
        let port_a = free_port();
        let port_b = free_port();
        let seed_a = member_on("node-a", port_a);
        let seed_b = member_on("node-b", port_b);

        let a = engine_on(port_a, "node-a", vec![seed_b.clone()]);
        let b = engine_on(port_b, "node-b", vec![seed_a.clone()]);
        a.start().await.unwrap();
        b.start().await.unwrap();

        // Seeded peers begin DOWN; the dead-member ping carries heartbeats
        // until the refresher promotes both sides.
        wait_until("both nodes seeing each other UP", || {
            a.live_members().iter().any(|m| m.id.0 == "node-b")
                && b.live_members().iter().any(|m| m.id.0 == "node-a")
        })
        .await;

        // Now a CRDT written on each side must converge on both.
        let grow = |items: &[&str], ts: i64| SharedDatum {
            key: "k".to_string(),
            node_id: NodeId("ignored".to_string()),
            timestamp: ts,
            expire_at: None,
            payload: Payload::Crdt(CrdtValue::GrowOnlySet(
                items.iter().map(|s| s.to_string()).collect(),
            )),
        };
        a.gossip_shared_data(grow(&["x"], 100)).unwrap();
        b.gossip_shared_data(grow(&["y"], 200)).unwrap();

        let expected: BTreeSet<String> = ["x", "y"].iter().map(|s| s.to_string()).collect();
        wait_until("CRDT convergence on both nodes", || {
            let on_a = a.find_crdt("k").unwrap();
            let on_b = b.find_crdt("k").unwrap();
            on_a == Some(CrdtValue::GrowOnlySet(expected.clone())) && on_a == on_b
        })
        .await;
        assert_eq!(
            a.find_shared_gossip_data("k").unwrap().unwrap().timestamp,
            200
        );

        a.stop().await;
        b.stop().await;
    }

    fn member_on(id: &str, port: u16) -> Member {
        Member::new(
            "test-cluster",
            NodeId(id.to_string()),
            Endpoint::udp("127.0.0.1", port),
            BTreeMap::new(),
        )
    }

    #[tokio::test]
    async fn test_shutdown_broadcast_downs_peer_quickly() {
        let port_a = free_port();
        let port_b = free_port();
        let a = engine_on(port_a, "node-a", vec![member_on("node-b", port_b)]);
        let b = engine_on(port_b, "node-b", vec![member_on("node-a", port_a)]);
        a.start().await.unwrap();
        b.start().await.unwrap();

        wait_until("mutual liveness", || {
            a.live_members().len() == 1 && b.live_members().len() == 1
        })
        .await;

        b.stop().await;
        wait_until("A marking B down after shutdown notice", || {
            a.live_members().is_empty()
        })
        .await;
        a.stop().await;
    }
}
