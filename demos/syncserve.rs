// Copyright 2020 Joyent, Inc.

use std::env;
use std::sync::Mutex;

use slog::{debug, error, info, o, Drain, Logger};

use sync_rpc::batch::Context;
use sync_rpc::config::ServerConfig;
use sync_rpc::error::RpcError;
use sync_rpc::publish::Subscription;
use sync_rpc::server::ServerBuilder;
use sync_rpc::store::{Doc, DocStore};
use sync_rpc::value::{Map, Value};

fn arg_str(args: &[Value], i: usize) -> Result<String, RpcError> {
    args.get(i)
        .and_then(Value::as_str)
        .map(String::from)
        .ok_or_else(|| RpcError::new(400, format!("argument {} must be a string", i)))
}

async fn date_handler(ctx: Context, _args: Vec<Value>) -> Result<Value, RpcError> {
    debug!(ctx.log(), "handling date function request");
    Ok(Value::date_now())
}

async fn echo_handler(ctx: Context, args: Vec<Value>) -> Result<Value, RpcError> {
    debug!(ctx.log(), "handling echo function request");
    Ok(Value::Array(args))
}

async fn add_book_handler(ctx: Context, args: Vec<Value>) -> Result<Value, RpcError> {
    let id = arg_str(&args, 0)?;
    let mut attrs = args
        .get(1)
        .and_then(Value::as_map)
        .cloned()
        .unwrap_or_default();
    attrs.insert("owner".into(), ctx.user_id().into());
    ctx.insert(Doc::new("Book", id.as_str(), attrs));
    Ok(id.into())
}

async fn remove_book_handler(ctx: Context, args: Vec<Value>) -> Result<Value, RpcError> {
    let id = arg_str(&args, 0)?;
    match ctx.remove("Book", &id) {
        Some(_) => Ok(Value::Null),
        None => Err(RpcError::new(404, "not found")),
    }
}

async fn login_handler(ctx: Context, args: Vec<Value>) -> Result<Value, RpcError> {
    let user = arg_str(&args, 0)?;
    ctx.set_user_id(Some(user));
    Ok(Value::Null)
}

/// All books, or the books on the shelf named by the first argument.
fn books_publication(ctx: &Context, sub: &Subscription) -> Result<(), RpcError> {
    let shelf = sub.args().get(0).and_then(Value::as_str).map(String::from);
    let wanted = shelf.clone();
    sub.match_kind("Book", move |doc| match &wanted {
        Some(shelf) => doc.get("shelf").and_then(Value::as_str) == Some(shelf.as_str()),
        None => true,
    });
    sub.hide_fields("Book", &["owner"]);
    for doc in ctx.server().store().docs("Book") {
        if ctx.conn().matches().has(&doc) {
            ctx.added(&doc);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let root_log = Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => "0.1.0"),
    );

    let mut config = match env::args().nth(2) {
        Some(path) => ServerConfig::from_file(&path).unwrap_or_else(|e| {
            error!(root_log, "failed to read config"; "path" => &path, "err" => %e);
            std::process::exit(1)
        }),
        None => ServerConfig::default(),
    };
    if let Some(addr) = env::args().nth(1) {
        config.address = addr;
    }
    let addr = config.address.clone();

    let server = ServerBuilder::new(config, Some(&root_log))
        .rpc("date", date_handler)
        .rpc("echo", echo_handler)
        .rpc("addBook", add_book_handler)
        .rpc("removeBook", remove_book_handler)
        .rpc("login", login_handler)
        .publish("Books", books_publication)
        .add_to_dict("Book")
        .add_to_dict("shelf")
        .add_to_dict("title")
        .on_connection(|conn| {
            let log = conn.log().clone();
            info!(log, "client joined");
            conn.on_close(move |conn| {
                info!(log, "client left"; "sess_id" => conn.sess_id());
            });
        })
        .build();
    let server = match server {
        Ok(server) => server,
        Err(e) => {
            error!(root_log, "failed to build dictionary"; "err" => %e);
            std::process::exit(1)
        }
    };

    let mut attrs = Map::new();
    attrs.insert("title".into(), "The Left Hand of Darkness".into());
    attrs.insert("shelf".into(), "sf".into());
    server.insert(Doc::new("Book", "b1", attrs));

    info!(root_log, "listening for sync requests"; "address" => &addr);
    if let Err(e) = server.listen().await {
        error!(root_log, "server failed"; "err" => %e);
    }
}
