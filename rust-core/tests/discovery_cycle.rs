mod common;

use common::{
    connected_node, evaluations_by, fast_config, pick_port, seed_evaluation, thermometer_device,
    wait_until, DeviceResponder, StubFetcher,
};
use fog_reputation::device::Device;
use fog_reputation::ledger::{LedgerGateway, LocalLedger};
use fog_reputation::node::http::ServiceFetcher;
use fog_reputation::node::{NodeConfig, ReplyRetention, ServiceOutcome};
use fog_reputation::transaction::{NodeServiceType, Payload, Transaction, TransactionType};
use fog_reputation::transport::LocalBroker;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(3);

fn provider_config(id: &str, ip: &str) -> NodeConfig {
    let mut cfg = fast_config(id);
    cfg.node_ip = ip.to_string();
    cfg
}

fn thermometer_replies(ledger: &LocalLedger) -> Vec<Transaction> {
    ledger.transactions_by_index(TransactionType::RepSvcThermometer.name(), true)
}

#[test]
fn thermometer_query_gets_one_targeted_reply() {
    let broker = LocalBroker::new();
    let ledger = Arc::new(LocalLedger::new());
    let provider = connected_node(
        provider_config("p1", "10.0.0.1"),
        &broker,
        &ledger,
        vec![
            thermometer_device("sc01"),
            Device::new("sc02", &[("humiditySensor", "HUMIDITY_SENSOR")]),
        ],
        None,
    );

    ledger
        .put(Transaction::has_service("requester", "default", NodeServiceType::Thermometer))
        .expect("query");
    wait_until("service reply", WAIT, || !thermometer_replies(&ledger).is_empty());
    thread::sleep(Duration::from_millis(50));

    let replies = thermometer_replies(&ledger);
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].tx_type(), TransactionType::RepSvcThermometer);
    assert_eq!(replies[0].target(), Some("requester"));
    let Payload::ReputationService(reply) = &replies[0].payload else {
        panic!("expected a service reply");
    };
    assert_eq!(reply.source, "p1");
    assert_eq!(reply.source_ip, "10.0.0.1");
    assert_eq!(reply.services.len(), 1);
    assert_eq!(reply.services[0].device_id, "sc01");
    assert_eq!(reply.services[0].sensor_id, "temperatureSensor");

    // A service the node cannot offer stays unanswered.
    ledger
        .put(Transaction::has_service("requester", "default", NodeServiceType::PulseOxymeter))
        .expect("query");
    thread::sleep(Duration::from_millis(100));
    assert!(ledger
        .transactions_by_index(TransactionType::RepSvcPulseOxymeter.name(), true)
        .is_empty());

    provider.node.stop();
}

struct Network {
    ledger: Arc<LocalLedger>,
    fetcher: Arc<StubFetcher>,
    consumer: common::TestNode,
    providers: Vec<common::TestNode>,
}

fn network(retention: ReplyRetention) -> Network {
    let broker = LocalBroker::new();
    let ledger = Arc::new(LocalLedger::new());
    let fetcher = Arc::new(StubFetcher::default());
    let mut cfg = fast_config("c");
    cfg.reply_retention = retention;
    let consumer = connected_node(
        cfg,
        &broker,
        &ledger,
        Vec::new(),
        Some(fetcher.clone() as Arc<dyn ServiceFetcher>),
    );
    let providers = vec![
        connected_node(
            provider_config("p1", "10.0.0.1"),
            &broker,
            &ledger,
            vec![thermometer_device("p1-dev")],
            None,
        ),
        connected_node(
            provider_config("p2", "10.0.0.2"),
            &broker,
            &ledger,
            vec![thermometer_device("p2-dev")],
            None,
        ),
    ];
    Network {
        ledger,
        fetcher,
        consumer,
        providers,
    }
}

impl Network {
    fn stop(self) {
        self.consumer.node.stop();
        for p in self.providers {
            p.node.stop();
        }
    }
}

#[test]
fn best_reputed_peer_wins_among_all_replies() {
    let net = network(ReplyRetention::Accumulate);
    seed_evaluation(&net.ledger, "p1", 0.9);
    seed_evaluation(&net.ledger, "p2", 0.4);
    net.fetcher.answer("10.0.0.1", Some("22.5"));
    net.fetcher.answer("10.0.0.2", Some("19.0"));
    let consumer = &net.consumer.node;

    assert!(consumer.request_node_services(NodeServiceType::Thermometer).expect("query"));
    wait_until("both replies", WAIT, || consumer.pending_replies().len() == 2);
    consumer.close_collection_window();
    let outcome = consumer.use_node_service().expect("cycle");

    match outcome {
        ServiceOutcome::Evaluated { provider, device, value, recorded } => {
            assert_eq!(provider, "p1");
            assert_eq!(device.device_id, "p1-dev");
            assert_eq!(value, 1.0);
            assert!(recorded);
        }
        other => panic!("expected an evaluated provider, got {:?}", other),
    }
    assert_eq!(evaluations_by(&net.ledger, "p1", "c"), vec![1.0]);
    assert!(evaluations_by(&net.ledger, "p2", "c").is_empty());
    assert_eq!(
        net.fetcher.calls(),
        vec![("10.0.0.1".to_string(), "p1-dev".to_string(), "temperatureSensor".to_string())]
    );
    assert!(!consumer.is_requesting_node_services());
    assert_eq!(consumer.last_requested_service(), None);
    net.stop();
}

#[test]
fn keep_latest_ranks_only_the_last_reply() {
    let net = network(ReplyRetention::KeepLatest);
    seed_evaluation(&net.ledger, "p1", 0.9);
    seed_evaluation(&net.ledger, "p2", 0.4);
    net.fetcher.answer("10.0.0.1", Some("22.5"));
    net.fetcher.answer("10.0.0.2", Some("19.0"));
    let consumer = &net.consumer.node;

    consumer.request_node_services(NodeServiceType::Thermometer).expect("query");
    wait_until("both replies on the ledger", WAIT, || thermometer_replies(&net.ledger).len() == 2);
    let last = thermometer_replies(&net.ledger)[1].source().to_string();
    wait_until("last reply collected", WAIT, || {
        consumer
            .pending_replies()
            .first()
            .is_some_and(|r| r.source == last)
    });
    assert_eq!(consumer.pending_replies().len(), 1);

    consumer.close_collection_window();
    match consumer.use_node_service().expect("cycle") {
        ServiceOutcome::Evaluated { provider, .. } => assert_eq!(provider, last),
        other => panic!("expected an evaluated provider, got {:?}", other),
    }
    net.stop();
}

#[test]
fn null_sentinel_records_a_failed_service() {
    let net = network(ReplyRetention::Accumulate);
    seed_evaluation(&net.ledger, "p1", 0.9);
    seed_evaluation(&net.ledger, "p2", 0.4);
    net.fetcher.answer("10.0.0.1", None);
    let consumer = &net.consumer.node;

    consumer.request_node_services(NodeServiceType::Thermometer).expect("query");
    wait_until("both replies", WAIT, || consumer.pending_replies().len() == 2);
    consumer.close_collection_window();
    match consumer.use_node_service().expect("cycle") {
        ServiceOutcome::Evaluated { provider, value, .. } => {
            assert_eq!(provider, "p1");
            assert_eq!(value, 0.0);
        }
        other => panic!("expected an evaluated provider, got {:?}", other),
    }
    assert_eq!(evaluations_by(&net.ledger, "p1", "c"), vec![0.0]);
    net.stop();
}

#[test]
fn replies_after_the_window_are_not_ranked() {
    let net = network(ReplyRetention::Accumulate);
    let consumer = &net.consumer.node;

    consumer.request_node_services(NodeServiceType::Thermometer).expect("query");
    consumer.close_collection_window();
    wait_until("replies on the ledger", WAIT, || thermometer_replies(&net.ledger).len() == 2);
    thread::sleep(Duration::from_millis(50));
    assert!(consumer.pending_replies().is_empty());
    assert_eq!(consumer.use_node_service().expect("cycle"), ServiceOutcome::NoReplies);
    assert!(net.fetcher.calls().is_empty());
    net.stop();
}

#[test]
fn unreachable_provider_is_evaluated_negatively() {
    let net = network(ReplyRetention::Accumulate);
    seed_evaluation(&net.ledger, "p2", 1.0);
    // No answer registered for p2: every fetch fails.
    let consumer = &net.consumer.node;

    consumer.request_node_services(NodeServiceType::Thermometer).expect("query");
    wait_until("both replies", WAIT, || consumer.pending_replies().len() == 2);
    consumer.close_collection_window();
    match consumer.use_node_service().expect("cycle") {
        ServiceOutcome::Evaluated { provider, value, .. } => {
            assert_eq!(provider, "p2");
            assert_eq!(value, 0.0);
        }
        other => panic!("expected an evaluated provider, got {:?}", other),
    }
    assert_eq!(evaluations_by(&net.ledger, "p2", "c"), vec![0.0]);
    net.stop();
}

#[test]
fn enable_failure_and_lost_evaluation_still_end_the_cycle() {
    let net = network(ReplyRetention::Accumulate);
    seed_evaluation(&net.ledger, "p1", 0.9);
    seed_evaluation(&net.ledger, "p2", 0.4);
    net.fetcher.answer("10.0.0.1", Some("22.5"));
    net.fetcher.fail_enable(true);
    let consumer = &net.consumer.node;

    consumer.request_node_services(NodeServiceType::Thermometer).expect("query");
    wait_until("both replies", WAIT, || consumer.pending_replies().len() == 2);
    consumer.close_collection_window();
    let before = net.ledger.len();
    net.ledger.close();

    match consumer.use_node_service().expect("cycle") {
        ServiceOutcome::Evaluated { provider, value, recorded, .. } => {
            assert_eq!(provider, "p1");
            assert_eq!(value, 1.0);
            assert!(!recorded);
        }
        other => panic!("expected an evaluated provider, got {:?}", other),
    }
    assert_eq!(net.fetcher.enable_calls(), 1);
    assert_eq!(net.fetcher.calls().len(), 1);
    assert_eq!(net.ledger.len(), before);
    assert!(!consumer.is_requesting_node_services());
    assert!(!consumer.can_receive_nodes_response());
    assert!(consumer.pending_replies().is_empty());
    net.stop();
}

#[test]
fn full_cycle_over_http_with_scheduled_tasks() {
    let broker = LocalBroker::new();
    let ledger = Arc::new(LocalLedger::new());
    let port = pick_port();

    let mut provider_cfg = provider_config("p1", "127.0.0.1");
    provider_cfg.http.listen_addr = Some(format!("127.0.0.1:{}", port));
    let provider = connected_node(
        provider_cfg,
        &broker,
        &ledger,
        vec![thermometer_device("sc01")],
        None,
    );
    let responder = DeviceResponder::start(&broker, &["sc01"], "23.4");
    provider.node.request_data_from_random_device().expect("poll");
    wait_until("reading cached", WAIT, || {
        provider.node.readings().latest("sc01", "temperatureSensor").is_some()
    });

    let mut consumer_cfg = fast_config("c");
    consumer_cfg.http.port = port;
    consumer_cfg.requested_services = vec![NodeServiceType::Thermometer];
    consumer_cfg.tasks.check_nodes_services_ms = 60_000;
    consumer_cfg.tasks.check_devices_ms = 60_000;
    consumer_cfg.tasks.request_data_ms = 60_000;
    let consumer = connected_node(consumer_cfg, &broker, &ledger, Vec::new(), None);
    consumer.node.spawn_tasks();

    wait_until("provider evaluated by consumer", Duration::from_secs(5), || {
        !evaluations_by(&ledger, "p1", "c").is_empty()
    });
    assert_eq!(evaluations_by(&ledger, "p1", "c"), vec![1.0]);
    wait_until("cycle reset", WAIT, || !consumer.node.is_requesting_node_services());

    consumer.node.stop();
    provider.node.stop();
    responder.stop();
}
