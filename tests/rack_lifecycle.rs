//! Driver-level lifecycle: a rack booting against an in-memory cluster,
//! heartbeating, and running tasks end to end through the manager.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use weir_cluster::mock::MockCluster;
use weir_cluster::{
    Channel, Client, Task as ClusterTask, RACK_HEARTBEAT_CHANNEL, TASK_CMD_CHANNEL,
    TASK_SET_CHANNEL,
};
use weir_core::breaker;
use weir_core::frame::Frame;
use weir_core::series::{DataType, Series};
use weir_core::telem::MILLISECOND;
use weir_driver::config::Config;
use weir_driver::integrations::build_factories;
use weir_task::{Manager, MultiFactory};

fn wait_for<F: Fn() -> bool>(cond: F) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    panic!("condition not reached within timeout");
}

fn breaker_config() -> breaker::Config {
    breaker::Config {
        name: "driver-test".to_string(),
        base_interval: MILLISECOND,
        max_retries: 5,
        scale: 1.0,
    }
}

fn boot(cluster: &MockCluster, integrations: Vec<&str>) -> (Manager, weir_cluster::Rack) {
    let rack = cluster.create_rack("it-rack").unwrap();
    let cfg = Config {
        integrations: integrations.into_iter().map(String::from).collect(),
        ..Config::default()
    };
    let factories = build_factories(&cfg, &breaker_config());
    let mut manager = Manager::new(
        rack.clone(),
        Arc::new(cluster.clone()),
        MultiFactory::new(factories),
        breaker_config(),
    );
    manager.start().unwrap();
    (manager, rack)
}

fn push_task_set(cluster: &MockCluster, key: u64) {
    let ch = cluster.retrieve_channel(TASK_SET_CHANNEL).unwrap();
    cluster.push_frame(Frame::single(ch.key, Series::from_u64s(vec![key])));
}

fn push_cmd(cluster: &MockCluster, cmd: serde_json::Value) {
    let ch = cluster.retrieve_channel(TASK_CMD_CHANNEL).unwrap();
    let mut series = Series::with_capacity(DataType::String, 1);
    series.push_string(cmd.to_string()).unwrap();
    cluster.push_frame(Frame::single(ch.key, series));
}

#[test]
fn rack_boots_and_heartbeats() {
    let cluster = MockCluster::new();
    let (mut manager, rack) = boot(&cluster, vec!["meminfo"]);

    let hb = cluster.retrieve_channel(RACK_HEARTBEAT_CHANNEL).unwrap();
    wait_for(|| !cluster.written_to(hb.key).is_empty());
    manager.stop().unwrap();

    let beats = cluster.written_to(hb.key);
    let first = beats[0].at_u64(0).unwrap();
    assert_eq!((first >> 32) as u32, rack.key);

    // The heartbeat task descriptor was materialized on the rack.
    let tasks = cluster.retrieve_rack_tasks(rack.key).unwrap();
    assert!(tasks.iter().any(|t| t.task_type == "heartbeat" && t.internal));
}

#[test]
fn sequence_task_full_lifecycle() {
    let cluster = MockCluster::new();
    let (mut manager, rack) = boot(&cluster, vec!["sequence"]);

    let pressure = cluster
        .create_channel(Channel {
            name: "pressure".to_string(),
            data_type: DataType::Float64,
            ..Channel::default()
        })
        .unwrap();
    let alarm = cluster
        .create_channel(Channel {
            name: "alarm".to_string(),
            data_type: DataType::Float64,
            is_virtual: true,
            ..Channel::default()
        })
        .unwrap();

    let task = cluster
        .create_task(&ClusterTask {
            key: weir_cluster::task_key(rack.key, 0),
            name: "overpressure watch".to_string(),
            task_type: "sequence".to_string(),
            config: json!({
                "rate": 200.0,
                "graph": {
                    "nodes": [
                        { "key": "pressure", "type": "channel", "config": { "channel": pressure.key } },
                        { "key": "limit", "type": "constant", "config": { "value": 100.0 } },
                        { "key": "over", "type": "gt" },
                        { "key": "alarm", "type": "channel_write", "config": { "channel": alarm.key } }
                    ],
                    "edges": [
                        { "source": { "node": "pressure" }, "target": { "node": "over", "param": "lhs" } },
                        { "source": { "node": "limit" }, "target": { "node": "over", "param": "rhs" } },
                        { "source": { "node": "over" }, "target": { "node": "alarm", "param": "in" } }
                    ]
                }
            }),
            ..ClusterTask::default()
        })
        .unwrap();

    // Configure, then command a start with a correlation key.
    push_task_set(&cluster, task.key);
    wait_for(|| {
        cluster
            .task_states()
            .iter()
            .any(|s| s["message"] == "Task configured successfully")
    });
    push_cmd(&cluster, json!({ "task": task.key, "type": "start", "key": "c-start" }));
    wait_for(|| {
        cluster.task_states().iter().any(|s| {
            s["details"]["running"] == true && s["details"]["cmd"] == "c-start"
        })
    });

    // The graph reacts to streamed samples.
    wait_for(|| !cluster.written_to(alarm.key).is_empty());
    std::thread::sleep(Duration::from_millis(20));
    cluster.push_frame(Frame::single(pressure.key, Series::from_f64s(vec![250.0])));
    wait_for(|| {
        cluster
            .written_to(alarm.key)
            .last()
            .and_then(|s| s.at_f64(0))
            .map(|v| v == 1.0)
            .unwrap_or(false)
    });

    // Stop echoes the command key with running=false.
    push_cmd(&cluster, json!({ "task": task.key, "type": "stop", "key": "c-stop" }));
    wait_for(|| {
        cluster.task_states().iter().any(|s| {
            s["details"]["running"] == false && s["details"]["cmd"] == "c-stop"
        })
    });
    manager.stop().unwrap();
}

#[test]
fn meminfo_task_streams_after_auto_start() {
    let cluster = MockCluster::new();
    let (mut manager, rack) = boot(&cluster, vec!["meminfo"]);

    let mem = cluster
        .create_channel(Channel {
            name: "rack_mem_available".to_string(),
            data_type: DataType::Uint64,
            is_virtual: true,
            ..Channel::default()
        })
        .unwrap();
    let task = cluster
        .create_task(&ClusterTask {
            key: weir_cluster::task_key(rack.key, 0),
            name: "meminfo".to_string(),
            task_type: "meminfo".to_string(),
            config: json!({ "channel": mem.key, "rate": 100.0 }),
            ..ClusterTask::default()
        })
        .unwrap();

    push_task_set(&cluster, task.key);
    // The meminfo factory auto-starts, so data flows without a command.
    wait_for(|| !cluster.written_to(mem.key).is_empty());
    wait_for(|| {
        cluster
            .task_states()
            .iter()
            .any(|s| s["details"]["running"] == true)
    });
    manager.stop().unwrap();
}
