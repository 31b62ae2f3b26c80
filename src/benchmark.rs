use std::path::{Path, PathBuf};
use std::time::Instant;

use mysql::prelude::*;
use mysql::*;
use rand::distr::Alphanumeric;
use rand::Rng;
use tsbatch::datapoint::{collect_datapoints, DatapointArrayIterator};
use tsbatch::{Compression, Datapoint, InsertMethod, InsertOptions, Query, TimeseriesConfig, TimeseriesDB};

const NUM_POINTS: usize = 500_000;
const SERIES: &str = "bench";
const DAY: f64 = 24.0 * 60.0 * 60.0;

pub fn run_benchmarks() {
    println!("Running benchmarks with {} datapoints...", NUM_POINTS);

    let path = temp_db_path();
    let db = setup_our_engine(&path);
    let data = generate_test_data();

    let our_ingest_time = benchmark_our_ingest(&db, &data);
    benchmark_our_queries(&db, &data);

    let mysql_ingest_time = match std::env::var("MYSQL_URL") {
        Ok(url) => {
            let mut conn = setup_mysql(&url).expect("Failed to setup MySQL");
            let t = benchmark_mysql_ingest(&mut conn, &data);
            benchmark_mysql_queries(&mut conn, &data);
            Some(t)
        }
        Err(_) => {
            println!("\nMYSQL_URL not set, skipping the MySQL comparison");
            None
        }
    };

    println!("\nBenchmark Results:");
    println!("-----------------");
    println!("Our Engine ingest: {:.2}ms", our_ingest_time);
    println!(
        "Stored as {} batches",
        db.batch_lengths(SERIES, false).expect("batch listing").len()
    );
    if let Some(mysql_ingest_time) = mysql_ingest_time {
        println!("MySQL ingest: {:.2}ms", mysql_ingest_time);
        println!(
            "Total Speed Ratio (MySQL/Our): {:.2}x",
            mysql_ingest_time / our_ingest_time
        );
    }

    drop(db);
    let _ = std::fs::remove_file(&path);
}

fn temp_db_path() -> PathBuf {
    let name: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect();
    std::env::temp_dir().join(format!("tsbatch_bench_{name}.db"))
}

fn setup_our_engine(path: &Path) -> TimeseriesDB {
    let config = TimeseriesConfig::default().with_compression(Compression::Zstd(3));
    let db = TimeseriesDB::open(path, config).expect("Failed to open database");
    db.with_connection(|conn| {
        conn.execute("INSERT OR IGNORE INTO objects(id) VALUES (?1)", [SERIES])?;
        Ok(())
    })
    .expect("Failed to register series");
    db
}

fn setup_mysql(url: &str) -> std::result::Result<PooledConn, mysql::Error> {
    let pool = Pool::new(url)?;
    let mut conn = pool.get_conn()?;

    conn.query_drop("DROP TABLE IF EXISTS benchmark_ts")?;
    conn.query_drop(
        "CREATE TABLE benchmark_ts (
            t DOUBLE NOT NULL PRIMARY KEY,
            value DOUBLE NOT NULL
        )",
    )?;

    Ok(conn)
}

/// Roughly one datapoint a second with some jitter, values between 0 and 100.
fn generate_test_data() -> Vec<Datapoint> {
    let mut rng = rand::rng();
    let mut t = 1_600_000_000.0;
    (0..NUM_POINTS)
        .map(|_| {
            t += 0.5 + rng.random::<f64>();
            Datapoint::new(t, rng.random::<f64>() * 100.0)
        })
        .collect()
}

fn benchmark_our_ingest(db: &TimeseriesDB, data: &[Datapoint]) -> f64 {
    println!("Ingesting data into our engine...");
    let start = Instant::now();

    let part = data.len().div_ceil(3);
    for (part, chunk_size) in data.chunks(part).zip([100, 1000, 10000]) {
        let chunk_start = Instant::now();
        for chunk in part.chunks(chunk_size) {
            db.insert(
                SERIES,
                DatapointArrayIterator::new(chunk.to_vec()),
                InsertOptions::method(InsertMethod::Append),
            )
            .unwrap();
        }
        let duration = chunk_start.elapsed().as_secs_f64() * 1000.0;
        println!("Our engine chunk size {}: {:.2}ms", chunk_size, duration);
    }

    let total_duration = start.elapsed().as_secs_f64() * 1000.0;
    println!("Our engine ingest completed in {:.2}ms", total_duration);
    total_duration
}

fn benchmark_mysql_ingest(conn: &mut PooledConn, data: &[Datapoint]) -> f64 {
    println!("Ingesting data into MySQL...");
    let start = Instant::now();

    let mut tx = conn.start_transaction(TxOpts::default()).unwrap();
    for chunk in data.chunks(1000) {
        let mut params: Vec<Value> = Vec::with_capacity(chunk.len() * 2);
        for dp in chunk {
            params.push(Value::from(dp.timestamp));
            params.push(Value::from(dp.data.as_f64().unwrap_or_default()));
        }
        let placeholders = (0..chunk.len()).map(|_| "(?, ?)").collect::<Vec<_>>().join(",");
        let query = format!("INSERT INTO benchmark_ts (t, value) VALUES {}", placeholders);
        tx.exec_drop(&query, params).unwrap();
    }
    tx.commit().unwrap();

    let total_duration = start.elapsed().as_secs_f64() * 1000.0;
    println!("MySQL ingest completed in {:.2}ms", total_duration);
    total_duration
}

fn benchmark_our_queries(db: &TimeseriesDB, data: &[Datapoint]) {
    println!("\nRunning query benchmarks...");
    let t0 = data[0].timestamp;

    time_our_query(db, "Full scan", Query::new(SERIES));
    time_our_query(db, "One day", Query::new(SERIES).t1(t0 + DAY).t2(t0 + 2.0 * DAY));
    time_our_query(db, "Last 1000", Query::new(SERIES).i1(-1000));
    time_our_query(db, "Middle index", Query::new(SERIES).i((NUM_POINTS / 2) as i64));
    time_our_query(
        db,
        "Newest day, reversed",
        Query::new(SERIES).t1(data[data.len() - 1].timestamp - DAY).reversed(true),
    );
}

fn time_our_query(db: &TimeseriesDB, name: &str, q: Query) {
    let start = Instant::now();
    let mut it = db.query(&q).unwrap();
    let n = collect_datapoints(&mut it).unwrap().len();
    let duration = start.elapsed().as_secs_f64() * 1000.0;
    println!("{}: {} datapoints in {:.2}ms", name, n, duration);
}

fn benchmark_mysql_queries(conn: &mut PooledConn, data: &[Datapoint]) {
    let t0 = data[0].timestamp;
    time_mysql_query(conn, "Full scan", "SELECT t, value FROM benchmark_ts ORDER BY t".into());
    time_mysql_query(
        conn,
        "One day",
        format!(
            "SELECT t, value FROM benchmark_ts WHERE t >= {} AND t < {} ORDER BY t",
            t0 + DAY,
            t0 + 2.0 * DAY
        ),
    );
    time_mysql_query(
        conn,
        "Last 1000",
        "SELECT t, value FROM benchmark_ts ORDER BY t DESC LIMIT 1000".into(),
    );
    time_mysql_query(
        conn,
        "Middle index",
        format!("SELECT t, value FROM benchmark_ts ORDER BY t LIMIT 1 OFFSET {}", NUM_POINTS / 2),
    );
}

fn time_mysql_query(conn: &mut PooledConn, name: &str, query: String) {
    let start = Instant::now();
    conn.query_iter(query).unwrap().for_each(|_| {});
    println!("MySQL {}: {:.2}ms", name, start.elapsed().as_secs_f64() * 1000.0);
}
