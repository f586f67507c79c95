#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use crate::config::Distribution;
    use crate::membership::failure_detector::FailureDetector;
    use crate::membership::refresher::StateRefresher;
    use crate::membership::table::MembershipTable;
    use crate::membership::types::{Endpoint, Member, NodeId, PeerState};
    use crate::time::{Clock, ManualClock};

    fn member(cluster: &str, id: &str, port: u16) -> Member {
        Member::new(
            cluster,
            NodeId(id.to_string()),
            Endpoint::udp("127.0.0.1", port),
            BTreeMap::new(),
        )
    }

    fn detector() -> Arc<FailureDetector> {
        Arc::new(FailureDetector::new(100, 3, Distribution::Exponential))
    }

    // ============================================================
    // TYPES
    // ============================================================

    #[test]
    fn test_endpoint_parse_roundtrip() {
        let endpoint: Endpoint = "udp://10.0.0.7:5400".parse().unwrap();
        assert_eq!(endpoint.scheme, "udp");
        assert_eq!(endpoint.host, "10.0.0.7");
        assert_eq!(endpoint.port, 5400);
        assert_eq!(endpoint.to_string(), "udp://10.0.0.7:5400");
        assert_eq!(endpoint.socket_addr(), "10.0.0.7:5400");
    }

    #[test]
    fn test_endpoint_parse_rejects_garbage() {
        assert!("10.0.0.7:5400".parse::<Endpoint>().is_err());
        assert!("udp://:5400".parse::<Endpoint>().is_err());
        assert!("udp://host:notaport".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_member_topology_tags() {
        let mut m = member("c", "n1", 5000);
        assert!(m.datacenter().is_none());
        m.properties.insert("datacenter".to_string(), "dc1".to_string());
        m.properties.insert("rack".to_string(), "r2".to_string());
        assert_eq!(m.datacenter(), Some("dc1"));
        assert_eq!(m.rack(), Some("r2"));
    }

    // ============================================================
    // MEMBERSHIP TABLE
    // ============================================================

    #[test]
    fn test_new_peer_inserted_down() {
        let local = member("c", "local", 5000);
        let table = MembershipTable::new(&local, detector());

        let peer = member("c", "peer", 5001);
        table.upsert_from_heartbeat(&peer, 10, 0);

        let all = table.snapshot_all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].1, PeerState::Down);
        assert_eq!(all[0].0.heartbeat, 10);
        assert!(table.snapshot_live().is_empty());
    }

    #[test]
    fn test_local_member_never_inserted() {
        let local = member("c", "local", 5000);
        let table = MembershipTable::new(&local, detector());

        table.upsert_from_heartbeat(&local, 99, 0);
        table.seed(vec![local.clone()]);

        assert!(table.snapshot_all().is_empty());
    }

    #[test]
    fn test_heartbeat_is_monotonic_under_interleaving() {
        let local = member("c", "local", 5000);
        let table = MembershipTable::new(&local, detector());
        let peer = member("c", "peer", 5001);

        for hb in [5, 12, 3, 12, 9, 40, 17] {
            table.upsert_from_heartbeat(&peer, hb, hb);
        }
        assert_eq!(table.heartbeat_of(&peer.id), Some(40));
    }

    #[test]
    fn test_stale_heartbeat_does_not_report_arrival() {
        let local = member("c", "local", 5000);
        let fd = detector();
        let table = MembershipTable::new(&local, fd.clone());
        let peer = member("c", "peer", 5001);

        table.upsert_from_heartbeat(&peer, 10, 100);
        table.upsert_from_heartbeat(&peer, 20, 200);
        table.upsert_from_heartbeat(&peer, 15, 300);

        // Insert does not report; only the single advancing heartbeat does.
        assert!(fd.phi(&peer.id, 300).is_some());
        assert_eq!(fd.sample_count(&peer.id), 0);
    }

    #[test]
    fn test_property_map_replaced_on_change() {
        let local = member("c", "local", 5000);
        let table = MembershipTable::new(&local, detector());
        let mut peer = member("c", "peer", 5001);
        table.upsert_from_heartbeat(&peer, 1, 0);

        peer.properties.insert("rack".to_string(), "r9".to_string());
        table.upsert_from_heartbeat(&peer, 2, 10);

        let all = table.snapshot_all();
        assert_eq!(all[0].0.rack(), Some("r9"));
    }

    #[test]
    fn test_snapshots_are_ordered() {
        let local = member("c", "zz-local", 5000);
        let table = MembershipTable::new(&local, detector());

        for id in ["delta", "alpha", "charlie", "bravo"] {
            table.upsert_from_heartbeat(&member("c", id, 5001), 1, 0);
        }

        let ids: Vec<String> = table
            .snapshot_all()
            .into_iter()
            .map(|(m, _)| m.id.0)
            .collect();
        assert_eq!(ids, vec!["alpha", "bravo", "charlie", "delta"]);
    }

    #[test]
    fn test_seed_does_not_clobber_known_member() {
        let local = member("c", "local", 5000);
        let table = MembershipTable::new(&local, detector());
        let peer = member("c", "peer", 5001);

        table.upsert_from_heartbeat(&peer, 33, 0);
        table.seed(vec![peer.clone()]);

        assert_eq!(table.heartbeat_of(&peer.id), Some(33));
    }

    #[tokio::test]
    async fn test_state_change_notifies_listeners_in_order() {
        let local = member("c", "local", 5000);
        let table = MembershipTable::new(&local, detector());
        let peer = member("c", "peer", 5001);
        table.upsert_from_heartbeat(&peer, 1, 0);

        let events: Arc<Mutex<Vec<(String, PeerState)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        table.register_listener(Arc::new(move |m, s| {
            sink.lock().unwrap().push((m.id.0.clone(), s));
        }));
        let pump = table.clone().start_event_pump();

        table.set_state(&peer.id, PeerState::Up);
        table.set_state(&peer.id, PeerState::Up); // no change, no event
        table.set_state(&peer.id, PeerState::Down);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let seen = events.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                ("peer".to_string(), PeerState::Up),
                ("peer".to_string(), PeerState::Down)
            ]
        );
        pump.abort();
    }

    #[tokio::test]
    async fn test_panicking_listener_does_not_starve_others() {
        let local = member("c", "local", 5000);
        let table = MembershipTable::new(&local, detector());
        let peer = member("c", "peer", 5001);
        table.upsert_from_heartbeat(&peer, 1, 0);

        table.register_listener(Arc::new(|_, _| panic!("listener bug")));
        let events: Arc<Mutex<Vec<PeerState>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        table.register_listener(Arc::new(move |_, s| {
            sink.lock().unwrap().push(s);
        }));
        let pump = table.clone().start_event_pump();

        table.set_state(&peer.id, PeerState::Up);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(events.lock().unwrap().as_slice(), &[PeerState::Up]);
        pump.abort();
    }

    #[test]
    fn test_unregister_listener() {
        let local = member("c", "local", 5000);
        let table = MembershipTable::new(&local, detector());
        let id = table.register_listener(Arc::new(|_, _| {}));
        table.unregister_listener(id);
        // Unregistering twice is harmless.
        table.unregister_listener(id);
    }

    // ============================================================
    // STATE REFRESHER
    // ============================================================

    fn refresher_fixture() -> (
        Arc<MembershipTable>,
        Arc<FailureDetector>,
        Arc<ManualClock>,
        Arc<StateRefresher>,
        Member,
    ) {
        let local = member("c", "local", 5000);
        let fd = Arc::new(FailureDetector::new(100, 3, Distribution::Exponential));
        let table = MembershipTable::new(&local, fd.clone());
        let clock = Arc::new(ManualClock::new(0, 0));
        let refresher = StateRefresher::new(
            table.clone(),
            fd.clone(),
            clock.clone(),
            8.0,
            Duration::from_millis(100),
        );
        let peer = member("c", "peer", 5001);
        (table, fd, clock, refresher, peer)
    }

    #[test]
    fn test_refresher_promotes_heartbeating_peer() {
        let (table, fd, clock, refresher, peer) = refresher_fixture();
        table.upsert_from_heartbeat(&peer, 1, 0);
        for tick in 0..10 {
            fd.report(&peer.id, tick * 100_000_000);
        }
        clock.advance_ns(10 * 100_000_000);

        refresher.refresh_once();
        assert_eq!(table.snapshot_live().len(), 1);
        assert!(table.snapshot_dead().is_empty());
    }

    #[test]
    fn test_refresher_demotes_silent_peer() {
        let (table, fd, clock, refresher, peer) = refresher_fixture();
        table.upsert_from_heartbeat(&peer, 1, 0);
        for tick in 0..10 {
            fd.report(&peer.id, tick * 100_000_000);
        }
        // Long silence: elapsed far beyond the 100 ms cadence.
        clock.advance_ns(10 * 100_000_000 + 30_000_000_000);

        refresher.refresh_once();
        assert_eq!(table.snapshot_dead().len(), 1);
        assert!(table.snapshot_live().is_empty());
    }

    #[test]
    fn test_refresher_leaves_unreported_seed_down() {
        let (table, _fd, clock, refresher, peer) = refresher_fixture();
        table.seed(vec![peer]);
        clock.advance_ns(60_000_000_000);

        refresher.refresh_once();
        assert_eq!(table.snapshot_dead().len(), 1);
    }

    #[test]
    fn test_down_peer_recovers_on_new_heartbeats() {
        let (table, fd, clock, refresher, peer) = refresher_fixture();
        table.upsert_from_heartbeat(&peer, 1, 0);
        for tick in 0..10 {
            fd.report(&peer.id, tick * 100_000_000);
        }
        clock.advance_ns(10 * 100_000_000 + 30_000_000_000);
        refresher.refresh_once();
        assert_eq!(table.snapshot_dead().len(), 1);

        // Heartbeats resume without any re-bootstrap.
        let resume = clock.now_ns();
        for tick in 1..5 {
            fd.report(&peer.id, resume + tick * 100_000_000);
        }
        clock.advance_ns(5 * 100_000_000);
        refresher.refresh_once();
        assert_eq!(table.snapshot_live().len(), 1);
    }

    #[test]
    fn test_force_down_bypasses_detector() {
        let (table, fd, clock, refresher, peer) = refresher_fixture();
        table.upsert_from_heartbeat(&peer, 1, 0);
        for tick in 0..10 {
            fd.report(&peer.id, tick * 100_000_000);
        }
        clock.advance_ns(10 * 100_000_000);
        refresher.refresh_once();
        assert_eq!(table.snapshot_live().len(), 1);

        table.force_down(&peer.id);
        assert_eq!(table.snapshot_dead().len(), 1);
    }
}
