// Copyright 2020 Joyent, Inc.

use std::error::Error as StdError;
use std::sync::{mpsc, Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

use slog::{debug, info, o, Drain, Level, LevelFilter, Logger};
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout};
use tokio_test::block_on;

use sync_rpc::batch::Context;
use sync_rpc::client::Client;
use sync_rpc::config::{ClientConfig, ServerConfig};
use sync_rpc::error::RpcError;
use sync_rpc::publish::Subscription;
use sync_rpc::server::{Server, ServerBuilder};
use sync_rpc::store::{Doc, DocStore};
use sync_rpc::value::{Map, Value};

fn test_log() -> Logger {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    Logger::root(
        Mutex::new(LevelFilter::new(
            slog_term::FullFormat::new(plain).build(),
            Level::Info,
        ))
        .fuse(),
        o!("build-id" => "0.1.0"),
    )
}

fn book(id: &str, shelf: &str) -> Doc {
    let mut attrs = Map::new();
    attrs.insert("shelf".into(), shelf.into());
    attrs.insert("title".into(), format!("title of {}", id).into());
    Doc::new("Book", id, attrs)
}

fn arg(args: &[Value], i: usize) -> String {
    args.get(i).and_then(Value::as_str).unwrap_or("").to_string()
}

async fn echo(ctx: Context, args: Vec<Value>) -> Result<Value, RpcError> {
    debug!(ctx.log(), "handling echo request");
    Ok(Value::Array(args))
}

async fn add_book(ctx: Context, args: Vec<Value>) -> Result<Value, RpcError> {
    ctx.insert(book(&arg(&args, 0), &arg(&args, 1)));
    Ok(Value::Null)
}

async fn move_book(ctx: Context, args: Vec<Value>) -> Result<Value, RpcError> {
    let mut changes = Map::new();
    changes.insert("shelf".into(), arg(&args, 1).into());
    match ctx.update("Book", &arg(&args, 0), &changes) {
        Some(_) => Ok(Value::Null),
        None => Err(RpcError::new(404, "no such book")),
    }
}

fn shelf(ctx: &Context, sub: &Subscription) -> Result<(), RpcError> {
    let shelf = arg(sub.args(), 0);
    let wanted = shelf.clone();
    sub.match_kind("Book", move |doc| {
        doc.get("shelf").and_then(Value::as_str) == Some(wanted.as_str())
    });
    for doc in ctx.server().store().docs("Book") {
        if doc.get("shelf").and_then(Value::as_str) == Some(shelf.as_str()) {
            ctx.added(&doc);
        }
    }
    Ok(())
}

fn build_server(log: &Logger) -> Server {
    let server = ServerBuilder::new(ServerConfig::default(), Some(log))
        .rpc("echo", echo)
        .rpc("addBook", add_book)
        .rpc("moveBook", move_book)
        .publish("Shelf", shelf)
        .add_to_dict("Book")
        .add_to_dict("shelf")
        .build()
        .expect("failed to build server");
    server.insert(book("b1", "sf"));
    server.insert(book("b2", "fiction"));
    server
}

#[tokio::main]
async fn run_server(
    addr: &'static str,
    handle: mpsc::Sender<Server>,
    barrier: Arc<Barrier>,
) {
    let root_log = test_log();
    let server = build_server(&root_log);
    let listener = TcpListener::bind(addr).await.expect("failed to bind");
    info!(root_log, "listening for sync requests"; "address" => addr);

    let _ = handle.send(server.clone());
    barrier.wait();

    if let Err(e) = server.serve(listener).await {
        eprintln!("server failed: {}", e);
    }
}

fn start_server(addr: &'static str) -> Server {
    let barrier = Arc::new(Barrier::new(2));
    let barrier_clone = barrier.clone();
    let (tx, rx) = mpsc::channel();
    let _h_server = thread::spawn(move || run_server(addr, tx, barrier_clone));
    barrier.wait();
    rx.recv().expect("server did not start")
}

fn new_client(addr: &str) -> Client {
    let config = ClientConfig {
        address: addr.to_string(),
        retry_base_ms: 50,
        ..ClientConfig::default()
    };
    let client = Client::new(config, Some(&test_log()));
    client.register_publication("Shelf", |scope, args| {
        let shelf = arg(args, 0);
        scope.match_kind("Book", move |doc| {
            doc.get("shelf").and_then(Value::as_str) == Some(shelf.as_str())
        });
        Ok(())
    });
    client
}

async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    false
}

async fn run_rpc_client(addr: &str) -> Result<(), Box<dyn StdError>> {
    let client = new_client(addr);

    let results = Arc::new(Mutex::new(Vec::new()));
    for i in 1..=5 {
        let r = Arc::clone(&results);
        client.rpc(
            "echo",
            vec![i.into()],
            Some(Box::new(move |res: Result<Value, RpcError>| {
                r.lock().unwrap().push(res)
            })),
        )?;
    }
    assert_eq!(client.pending(), 5);

    client.start();
    timeout(Duration::from_secs(5), client.wait_synced()).await?;
    let expected: Vec<Result<Value, RpcError>> = (1..=5)
        .map(|i| Ok(Value::Array(vec![Value::from(i)])))
        .collect();
    assert_eq!(*results.lock().unwrap(), expected);

    let big = "a".repeat(100_000);
    let reply = client.call("echo", vec![big.as_str().into()]).await?;
    assert_eq!(reply, Value::Array(vec![big.into()]));

    let err = client.call("nope", vec![]).await.unwrap_err();
    assert_eq!(err.code(), Some(404));

    let err = client
        .call("moveBook", vec!["missing".into(), "sf".into()])
        .await
        .unwrap_err();
    assert_eq!(err, RpcError::new(404, "no such book"));

    client.stop();
    Ok(())
}

async fn run_subscription_client(addr: &str) -> Result<(), Box<dyn StdError>> {
    let client = new_client(addr);
    client.start();
    timeout(Duration::from_secs(5), client.wait_ready()).await?;

    let acked = Arc::new(Mutex::new(None));
    let a2 = Arc::clone(&acked);
    let sub_id = client.subscribe(
        "Shelf",
        vec!["sf".into()],
        Some(Box::new(move |res: Result<(), RpcError>| {
            *a2.lock().unwrap() = Some(res)
        })),
    )?;
    timeout(Duration::from_secs(5), client.wait_synced()).await?;
    assert_eq!(*acked.lock().unwrap(), Some(Ok(())));

    let store = Arc::clone(client.store());
    assert!(store.find("Book", "b1").is_some());
    assert!(store.find("Book", "b2").is_none());

    // the added document arrives before the reply
    client.call("addBook", vec!["b3".into(), "sf".into()]).await?;
    assert!(store.find("Book", "b3").is_some());

    client.call("moveBook", vec!["b1".into(), "fiction".into()]).await?;
    assert!(store.find("Book", "b1").is_none());

    client.unsubscribe(sub_id.as_str());
    assert!(store.find("Book", "b3").is_none());
    assert_eq!(client.pending(), 0);

    client.stop();
    Ok(())
}

async fn run_two_clients(addr: &str) -> Result<(), Box<dyn StdError>> {
    let reader = new_client(addr);
    let writer = new_client(addr);
    reader.start();
    writer.start();
    timeout(Duration::from_secs(5), reader.wait_ready()).await?;
    timeout(Duration::from_secs(5), writer.wait_ready()).await?;

    reader.subscribe("Shelf", vec!["poetry".into()], None)?;
    writer.subscribe("Shelf", vec!["history".into()], None)?;
    timeout(Duration::from_secs(5), reader.wait_synced()).await?;
    timeout(Duration::from_secs(5), writer.wait_synced()).await?;

    writer
        .call("addBook", vec!["p1".into(), "poetry".into()])
        .await?;
    let reader_store = Arc::clone(reader.store());
    assert!(eventually(|| reader_store.find("Book", "p1").is_some()).await);
    assert!(writer.store().find("Book", "p1").is_none());

    reader.stop();
    writer.stop();
    Ok(())
}

async fn run_reconnecting_client(
    addr: &str,
    server: &Server,
) -> Result<(), Box<dyn StdError>> {
    let client = new_client(addr);
    client.start();
    timeout(Duration::from_secs(5), client.wait_ready()).await?;
    client.subscribe("Shelf", vec!["sf".into()], None)?;
    timeout(Duration::from_secs(5), client.wait_synced()).await?;
    let store = Arc::clone(client.store());
    assert!(store.find("Book", "b1").is_some());

    let first = server.connections()[0].sess_id().to_string();
    for conn in server.connections() {
        conn.close();
    }

    // the call and the subscription are replayed on the new connection
    let reply = timeout(
        Duration::from_secs(5),
        client.call("addBook", vec!["b5".into(), "sf".into()]),
    )
    .await??;
    assert_eq!(reply, Value::Null);
    assert!(eventually(|| store.find("Book", "b5").is_some()).await);
    assert!(client.is_ready());
    assert_eq!(client.pending(), 0);

    let conns = server.connections();
    assert_eq!(conns.len(), 1);
    assert_ne!(conns[0].sess_id(), first);
    assert_eq!(conns[0].subs().len(), 1);

    client.stop();
    Ok(())
}

#[test]
fn rpc_calls_replay_in_order() {
    start_server("127.0.0.1:56652");
    assert!(block_on(run_rpc_client("127.0.0.1:56652")).is_ok());
}

#[test]
fn subscriptions_follow_changes() {
    start_server("127.0.0.1:56653");
    assert!(block_on(run_subscription_client("127.0.0.1:56653")).is_ok());
}

#[test]
fn connections_match_independently() {
    start_server("127.0.0.1:56654");
    assert!(block_on(run_two_clients("127.0.0.1:56654")).is_ok());
}

#[test]
fn dropped_connections_are_resumed() {
    let server = start_server("127.0.0.1:56655");
    assert!(block_on(run_reconnecting_client("127.0.0.1:56655", &server)).is_ok());
}
