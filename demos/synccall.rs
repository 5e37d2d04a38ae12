// Copyright 2020 Joyent, Inc.

use std::process;
use std::sync::Mutex;
use std::time::Duration;

use clap::{crate_version, value_t, App, Arg, ArgMatches};
use slog::{o, Drain, Logger};
use tokio::time::timeout;

use sync_rpc::client::Client;
use sync_rpc::config::ClientConfig;
use sync_rpc::store::DocStore;
use sync_rpc::value::Value;

static APP: &'static str = "synccall";
static DEFAULT_HOST: &'static str = "127.0.0.1";
const DEFAULT_PORT: u32 = 2030;

pub fn parse_opts<'a, 'b>(app: String) -> ArgMatches<'a> {
    App::new(app)
        .about("Command-line tool for calling a sync-rpc method")
        .version(crate_version!())
        .arg(
            Arg::with_name("host")
                .help("DNS name or IP address for remote server")
                .long("host")
                .short("h")
                .takes_value(true)
                .required(false),
        )
        .arg(
            Arg::with_name("port")
                .help("TCP port for remote server (Default: 2030)")
                .long("port")
                .short("p")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("method")
                .help("Name of remote RPC method call")
                .long("method")
                .short("m")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::with_name("args")
                .help("JSON array of arguments for RPC method call")
                .long("args")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::with_name("subscribe")
                .help("Publication to subscribe to before the call")
                .long("subscribe")
                .short("s")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("kind")
                .help("Document kind to print after the call")
                .long("kind")
                .short("k")
                .takes_value(true),
        )
        .get_matches()
}

fn call_args(args: serde_json::Value) -> Vec<Value> {
    match Value::from(args) {
        Value::Array(args) => args,
        other => vec![other],
    }
}

#[tokio::main]
async fn main() {
    let matches = parse_opts(APP.to_string());
    let host = String::from(matches.value_of("host").unwrap_or(DEFAULT_HOST));
    let port = value_t!(matches, "port", u32).unwrap_or(DEFAULT_PORT);
    let method = String::from(matches.value_of("method").unwrap_or_else(|| {
        eprintln!("Failed to parse method argument as String");
        process::exit(1)
    }));
    let args = value_t!(matches, "args", serde_json::Value).unwrap_or_else(|e| e.exit());

    let plain = slog_term::PlainSyncDecorator::new(std::io::stderr());
    let log = Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => "0.1.0"),
    );

    let config = ClientConfig {
        address: [host, String::from(":"), port.to_string()].concat(),
        ..ClientConfig::default()
    };
    let client = Client::new(config, Some(&log));

    let kind = matches.value_of("kind").map(String::from);
    if let Some(name) = matches.value_of("subscribe") {
        let shown = kind.clone();
        client.register_publication(name, move |scope, _| {
            if let Some(kind) = &shown {
                scope.match_kind(kind, |_| true);
            }
            Ok(())
        });
        if let Err(e) = client.subscribe(name, vec![], None) {
            eprintln!("Error: {}", e);
            process::exit(1)
        }
    }

    client.start();
    if timeout(Duration::from_secs(10), client.wait_ready()).await.is_err() {
        eprintln!("Failed to connect to server");
        process::exit(1)
    }

    match client.call(&method, call_args(args)).await {
        Ok(result) => println!("{}", serde_json::Value::from(result)),
        Err(e) => eprintln!("Error: {}", e),
    }

    if let Some(kind) = kind {
        let _ = timeout(Duration::from_secs(10), client.wait_synced()).await;
        for doc in client.store().docs(&kind) {
            let attrs = serde_json::Value::from(Value::Map(doc.attrs.clone()));
            println!("{} {}", doc.id, attrs);
        }
    }

    client.stop();
}
