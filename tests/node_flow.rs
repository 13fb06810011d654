//! End-to-end worker flow over a real socket: ingest a local JSON source
//! via a task, poll the node state into a coordinator-side shadow, fan a
//! query out and finally expire the spec.

use std::io::Write;
use std::net::TcpListener;
use std::sync::Arc;

use nebula::data::{DataType, Field, Schema, Value};
use nebula::execution::{BlockManager, JsonFileLoader};
use nebula::meta::{NodeInfo, Spec};
use nebula::query::{CompareOp, Filter, QueryPlan};
use nebula::service::{NodeClient, NodeServer, Task, TaskState, TcpNodeClient};

fn schema() -> Schema {
    Schema::new(vec![
        Field::new("id", DataType::Int32),
        Field::new("region", DataType::String),
        Field::new("clicks", DataType::Int64),
    ])
}

fn start_node() -> (String, Arc<BlockManager>) {
    let mut loader = JsonFileLoader::new();
    loader.register("events", schema());

    let node_blocks = Arc::new(BlockManager::new());
    let server = Arc::new(NodeServer::new(Arc::clone(&node_blocks), Arc::new(loader)));

    let listener = TcpListener::bind("127.0.0.1:0").expect("bind test listener");
    let addr = listener.local_addr().expect("local addr").to_string();
    std::thread::spawn(move || {
        let _ = server.serve(listener);
    });
    (addr, node_blocks)
}

#[test]
fn test_ingest_poll_query_expire() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("part.json");
    let mut f = std::fs::File::create(&path).unwrap();
    writeln!(f, r#"{{"id": 1, "region": "us", "clicks": 10}}"#).unwrap();
    writeln!(f, r#"{{"id": 2, "region": "eu", "clicks": 3}}"#).unwrap();
    writeln!(f, r#"{{"id": 3, "region": "us", "clicks": 7}}"#).unwrap();

    let (addr, _node_blocks) = start_node();

    // the coordinator keeps its own manager holding shadow states
    let coordinator = Arc::new(BlockManager::new());
    let mut client = TcpNodeClient::new(addr.clone(), Arc::clone(&coordinator));

    // liveness
    assert_eq!(client.echo("nebula").unwrap(), "nebula");
    assert_eq!(client.echos("n", 3).unwrap().len(), 3);

    // ingest one spec
    let spec = Spec::new(
        "1.1000",
        "events",
        path.to_string_lossy().to_string(),
        0,
        99,
        "",
    );
    let spec_id = spec.id().to_string();
    assert_eq!(client.task(&Task::ingest(spec)), TaskState::Succeeded);

    // poll: the shadow now reports the spec
    client.update().unwrap();
    let active = coordinator.active_specs(&[NodeInfo::new(addr.clone())]);
    assert!(active.contains(&spec_id));

    // query with a filter; rows come back as a flat batch
    let plan = QueryPlan {
        fields: vec!["id".into(), "clicks".into()],
        filter: Filter::Compare {
            field: "clicks".into(),
            op: CompareOp::Ge,
            value: Value::Int64(5),
        },
        ..QueryPlan::scan("events")
    };
    let rows: Vec<_> = client.execute(&plan).unwrap().collect();
    assert_eq!(rows.len(), 2);
    for row in &rows {
        match row.get("clicks") {
            Value::Int64(c) => assert!(*c >= 5),
            other => panic!("clicks lost its type: {:?}", other),
        }
    }

    // expire the spec and confirm the node dropped its blocks
    let state = client.task(&Task::expire(vec![("events".into(), spec_id.clone())]));
    assert_eq!(state, TaskState::Succeeded);
    client.update().unwrap();
    let active = coordinator.active_specs(&[NodeInfo::new(addr)]);
    assert!(!active.contains(&spec_id));
}
