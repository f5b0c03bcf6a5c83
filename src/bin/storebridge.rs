use std::path::{Path, PathBuf};
use std::sync::Arc;
use storebridge::Engine;
use storebridge::backup::{list_backups, verify_backup};
use storebridge::catalog::schema::DatabaseKind;
use storebridge::config::EngineConfig;
use storebridge::driver::sqlite::SqliteDriver;
use storebridge::query::plan::QueryRequest;

const DATABASE_ID: &str = "cli";

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), String> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        return Err("missing command".into());
    }
    match args[1].as_str() {
        "schema" => cmd_schema(&args[2..]).await,
        "query" => cmd_query(&args[2..]).await,
        "backup" => match args.get(2).map(String::as_str) {
            Some("list") => cmd_backup_list(&args[3..]),
            Some("verify") => cmd_backup_verify(&args[3..]),
            Some(other) => Err(format!("unknown backup command: {other}")),
            None => Err("missing backup subcommand".into()),
        },
        other => {
            print_usage();
            Err(format!("unknown top-level command: {other}"))
        }
    }
}

fn open_engine(args: &[String]) -> Result<Engine, String> {
    let db = parse_flag_value(args, "--db").ok_or("--db is required")?;
    if !Path::new(&db).is_file() {
        return Err(format!("no database file at {db}"));
    }
    let config = match parse_flag_value(args, "--config") {
        Some(path) => EngineConfig::from_json_file(Path::new(&path))
            .map_err(|e| format!("load config: {e}"))?,
        None => EngineConfig::default(),
    };
    let engine = Engine::new(config).map_err(|e| e.to_string())?;
    let driver = SqliteDriver::open(&db).map_err(|e| format!("open {db}: {e}"))?;
    engine
        .register_database(DATABASE_ID, DatabaseKind::DirectSql, Arc::new(driver))
        .map_err(|e| e.to_string())?;
    Ok(engine)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), String> {
    let text = serde_json::to_string_pretty(value).map_err(|e| format!("encode output: {e}"))?;
    println!("{text}");
    Ok(())
}

async fn cmd_schema(args: &[String]) -> Result<(), String> {
    let engine = open_engine(args)?;
    let schema = engine
        .get_or_load_schema(DATABASE_ID)
        .await
        .map_err(|e| format!("load schema: {e}"))?;
    print_json(schema.as_ref())
}

async fn cmd_query(args: &[String]) -> Result<(), String> {
    let sql = parse_flag_value(args, "--sql").ok_or("--sql is required")?;
    let engine = open_engine(args)?;
    let mut request = QueryRequest::sql(DATABASE_ID, &sql, Vec::new());
    if let Some(size) = parse_flag_value(args, "--page-size") {
        let size = size
            .parse::<usize>()
            .map_err(|e| format!("invalid --page-size: {e}"))?;
        request = request.page_size(size);
    }
    request = request.page_token(parse_flag_value(args, "--page-token"));
    let result = engine
        .execute_query(request)
        .await
        .map_err(|e| format!("{}: {e}", e.code_str()))?;
    print_json(&result)
}

fn cmd_backup_list(args: &[String]) -> Result<(), String> {
    let root = parse_flag_value(args, "--root").ok_or("--root is required")?;
    let listed = list_backups(&PathBuf::from(&root)).map_err(|e| format!("list {root}: {e}"))?;
    let manifests: Vec<serde_json::Value> = listed
        .into_iter()
        .map(|(path, manifest)| {
            serde_json::json!({
                "manifest": path.display().to_string(),
                "backup": manifest,
            })
        })
        .collect();
    print_json(&manifests)
}

fn cmd_backup_verify(args: &[String]) -> Result<(), String> {
    let manifest = parse_flag_value(args, "--manifest").ok_or("--manifest is required")?;
    let verified =
        verify_backup(Path::new(&manifest)).map_err(|e| format!("verify {manifest}: {e}"))?;
    print_json(&serde_json::json!({ "ok": true, "backup": verified }))
}

fn parse_flag_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|idx| args.get(idx + 1).cloned())
}

fn print_usage() {
    eprintln!("usage:");
    eprintln!("  storebridge schema --db <file.sqlite> [--config <config.json>]");
    eprintln!(
        "  storebridge query --db <file.sqlite> --sql <select> [--page-size <n>] [--page-token <token>]"
    );
    eprintln!("  storebridge backup list --root <backup-root>");
    eprintln!("  storebridge backup verify --manifest <file.manifest.json>");
}
