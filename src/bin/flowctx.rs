use flowctx::api::{ContextRequest, ErrorBody};
use flowctx::config::ContextConfig;
use flowctx::error::ContextError;
use flowctx::storage::{PageRequest, ScopeExport};
use flowctx::{ContextService, Tenant};
use serde::Serialize;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use tracing_subscriber::EnvFilter;

const DEFAULT_EXPORT_PAGE_SIZE: usize = 100;

#[derive(Serialize)]
struct Reply<T: Serialize> {
    status: u16,
    body: T,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(io::stderr)
        .init();
    if let Err(e) = run() {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        return Err("missing command".into());
    }
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("start runtime: {e}"))?;
    match args[1].as_str() {
        "serve" => runtime.block_on(cmd_serve(&args[2..])),
        "export" => runtime.block_on(cmd_export(&args[2..])),
        "import" => runtime.block_on(cmd_import(&args[2..])),
        other => {
            print_usage();
            Err(format!("unknown command: {other}"))
        }
    }
}

/// Reads one `ContextRequest` per stdin line and answers each with a
/// `{"status": .., "body": ..}` line on stdout.
async fn cmd_serve(args: &[String]) -> Result<(), String> {
    let service = open_service(args)?;
    let stdin = io::stdin();
    let mut out = BufWriter::new(io::stdout().lock());
    for line in stdin.lock().lines() {
        let line = line.map_err(|e| format!("read stdin: {e}"))?;
        if line.trim().is_empty() {
            continue;
        }
        let reply = match serde_json::from_str::<ContextRequest>(&line) {
            Ok(request) => match service.dispatch(request).await {
                Ok(response) => serde_json::to_string(&Reply {
                    status: 200,
                    body: response,
                }),
                Err(err) => error_reply(&err),
            },
            Err(e) => error_reply(&ContextError::Decode(e.to_string())),
        }
        .map_err(|e| format!("encode reply: {e}"))?;
        writeln!(out, "{reply}").map_err(|e| format!("write stdout: {e}"))?;
        out.flush().map_err(|e| format!("flush stdout: {e}"))?;
    }
    Ok(())
}

fn error_reply(err: &ContextError) -> Result<String, serde_json::Error> {
    let body = ErrorBody::from(err);
    serde_json::to_string(&Reply {
        status: body.status_code(),
        body,
    })
}

/// Writes every scope of a project as one JSON line per scope.
async fn cmd_export(args: &[String]) -> Result<(), String> {
    parse_flag_value(args, "--db").ok_or("--db is required")?;
    let project = parse_flag_value(args, "--project").ok_or("--project is required")?;
    let out_path = parse_flag_value(args, "--out").ok_or("--out is required")?;
    let page_size = match parse_flag_value(args, "--page-size") {
        Some(raw) => raw
            .parse::<usize>()
            .map_err(|e| format!("invalid --page-size: {e}"))?,
        None => DEFAULT_EXPORT_PAGE_SIZE,
    };
    let service = open_service(args)?;
    let tenant = Tenant::new(project.clone());
    let file = File::create(&out_path).map_err(|e| format!("create {out_path}: {e}"))?;
    let mut out = BufWriter::new(file);

    let mut page = PageRequest::new(page_size);
    let mut written = 0usize;
    loop {
        let result = service
            .export_page(&tenant, page)
            .await
            .map_err(|e| format!("export page: {e}"))?;
        for scope in &result.data {
            serde_json::to_writer(&mut out, scope).map_err(|e| format!("encode scope: {e}"))?;
            writeln!(out).map_err(|e| format!("write {out_path}: {e}"))?;
        }
        written += result.data.len();
        match result.next_cursor {
            Some(cursor) => page = PageRequest::new(page_size).with_cursor(cursor),
            None => break,
        }
    }
    out.flush().map_err(|e| format!("flush {out_path}: {e}"))?;
    println!("ok\t{project}\t{written}\t{out_path}");
    Ok(())
}

/// Replays an export dump into a store, replacing each listed scope.
async fn cmd_import(args: &[String]) -> Result<(), String> {
    parse_flag_value(args, "--db").ok_or("--db is required")?;
    let project = parse_flag_value(args, "--project").ok_or("--project is required")?;
    let dump = parse_flag_value(args, "--dump").ok_or("--dump is required")?;
    let service = open_service(args)?;
    let tenant = Tenant::new(project.clone());
    let file = File::open(&dump).map_err(|e| format!("open {dump}: {e}"))?;

    let mut imported = 0usize;
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| format!("read {dump}: {e}"))?;
        if line.trim().is_empty() {
            continue;
        }
        let scope: ScopeExport = serde_json::from_str(&line)
            .map_err(|e| format!("{dump}:{}: invalid scope record: {e}", idx + 1))?;
        service
            .import_bulk(&tenant, &scope.scope, scope.values)
            .await
            .map_err(|e| format!("import {}: {e}", scope.scope))?;
        imported += 1;
    }
    let used = service
        .usage(&tenant)
        .await
        .map_err(|e| format!("usage: {e}"))?;
    println!("ok\t{project}\t{imported}\t{used}");
    Ok(())
}

fn open_service(args: &[String]) -> Result<ContextService, String> {
    let mut config = match parse_flag_value(args, "--db") {
        Some(path) if path == ":memory:" => ContextConfig::sqlite_in_memory(),
        Some(path) => ContextConfig::sqlite(path),
        None => ContextConfig::development(),
    };
    if let Some(raw) = parse_flag_value(args, "--quota") {
        let quota = raw
            .parse::<u64>()
            .map_err(|e| format!("invalid --quota: {e}"))?;
        config = config.with_quota(quota);
    }
    ContextService::open(config).map_err(|e| format!("open context store: {e}"))
}

fn parse_flag_value(args: &[String], flag: &str) -> Option<String> {
    for idx in 0..args.len() {
        if args[idx] == flag {
            return args.get(idx + 1).cloned();
        }
    }
    None
}

fn print_usage() {
    eprintln!("usage:");
    eprintln!("  flowctx serve [--db <context.db>] [--quota <bytes>]");
    eprintln!(
        "  flowctx export --db <context.db> --project <id> --out <dump.jsonl> [--page-size <n>]"
    );
    eprintln!("  flowctx import --db <context.db> --project <id> --dump <dump.jsonl>");
}
