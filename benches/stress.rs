use std::time::{Duration, Instant};

use tokio_postgres::{Config, NoTls};
use ulid::Ulid;

const HOUR: i64 = 3_600_000; // 1 hour in ms

async fn connect(host: &str, port: u16, email: &str) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname("portal")
        .user(email)
        .password("coworkd");

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies.last().unwrap().as_secs_f64() * 1000.0,
    );
}

async fn create_resource(client: &tokio_postgres::Client, category: &str) -> Ulid {
    let rid = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO resources (id, name, category, capacity) VALUES ('{rid}', 'bench-{rid}', '{category}', 10)"
        ))
        .await
        .unwrap();
    rid
}

/// Baseline portal population so reads and the dashboard have data to chew on.
async fn setup(client: &tokio_postgres::Client) {
    let categories = [
        "meeting_room",
        "meeting_room",
        "meeting_room",
        "phone_booth",
        "phone_booth",
        "desk",
        "desk",
        "desk",
        "desk",
        "equipment",
    ];
    for category in categories {
        create_resource(client, category).await;
    }
    println!("  created {} resources", categories.len());
}

async fn phase1_sequential(host: &str, port: u16, admin: &str) {
    let client = connect(host, port, admin).await;
    let rid = create_resource(&client, "meeting_room").await;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    // Disjoint hour slots so every insert passes the conflict check.
    for i in 0..n {
        let bid = Ulid::new();
        let s = (i as i64) * HOUR;
        let e = s + HOUR;
        let t = Instant::now();
        client
            .batch_execute(&format!(
                r#"INSERT INTO bookings (id, resource_id, start, "end") VALUES ('{bid}', '{rid}', {s}, {e})"#
            ))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

async fn phase2_concurrent(host: &str, port: u16, admin: &str) {
    let n_tasks = 10;
    let n_per_task = 200;

    let start = Instant::now();
    let mut handles = Vec::new();

    for _ in 0..n_tasks {
        let host = host.to_string();
        let admin = admin.to_string();

        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &admin).await;
            // Each task books its own resource, so writes never conflict.
            let rid = create_resource(&client, "desk").await;

            for j in 0..n_per_task {
                let bid = Ulid::new();
                let s = (j as i64) * HOUR;
                let e = s + HOUR;
                client
                    .batch_execute(&format!(
                        r#"INSERT INTO bookings (id, resource_id, start, "end") VALUES ('{bid}', '{rid}', {s}, {e})"#
                    ))
                    .await
                    .unwrap();
            }
        }));
    }

    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} tasks x {n_per_task} bookings = {total} total in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
}

async fn phase3_read_under_load(host: &str, port: u16, admin: &str) {
    // Writer tasks: continuously add bookings in the background.
    let stop = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for _ in 0..5 {
        let host = host.to_string();
        let admin = admin.to_string();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &admin).await;
            let wrid = create_resource(&client, "equipment").await;
            let mut i = 0i64;
            while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                let bid = Ulid::new();
                let s = i * HOUR;
                let e = s + HOUR;
                let _ = client
                    .batch_execute(&format!(
                        r#"INSERT INTO bookings (id, resource_id, start, "end") VALUES ('{bid}', '{wrid}', {s}, {e})"#
                    ))
                    .await;
                i += 1;
            }
        }));
    }

    // Reader tasks: query availability on their own pre-filled resource.
    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();

    for _ in 0..n_readers {
        let host = host.to_string();
        let admin = admin.to_string();
        reader_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &admin).await;
            let rrid = create_resource(&client, "meeting_room").await;
            // Bookings so availability has gaps to compute.
            for i in 0..50 {
                let bid = Ulid::new();
                let s = (i as i64) * 2 * HOUR;
                let e = s + HOUR;
                client
                    .batch_execute(&format!(
                        r#"INSERT INTO bookings (id, resource_id, start, "end") VALUES ('{bid}', '{rrid}', {s}, {e})"#
                    ))
                    .await
                    .unwrap();
            }

            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                client
                    .batch_execute(&format!(
                        r#"SELECT * FROM availability WHERE resource_id = '{rrid}' AND start >= 0 AND "end" <= 7776000000"#
                    ))
                    .await
                    .unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.unwrap());
    }

    stop.store(true, std::sync::atomic::Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("availability query", &mut all_latencies);
}

async fn phase4_connection_storm(host: &str, port: u16, admin: &str) {
    let n_conns = 50;
    let ops_per_conn = 10;

    let start = Instant::now();
    let mut handles = Vec::new();
    let success = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));

    for _ in 0..n_conns {
        let host = host.to_string();
        let admin = admin.to_string();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &admin).await;
            let rid = create_resource(&client, "phone_booth").await;

            for i in 0..ops_per_conn {
                let bid = Ulid::new();
                let s = (i as i64) * HOUR;
                let e = s + HOUR;
                client
                    .batch_execute(&format!(
                        r#"INSERT INTO bookings (id, resource_id, start, "end") VALUES ('{bid}', '{rid}', {s}, {e})"#
                    ))
                    .await
                    .unwrap();
            }
            success.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }));
    }

    for h in handles {
        let _ = h.await;
    }

    let elapsed = start.elapsed();
    let ok = success.load(std::sync::atomic::Ordering::Relaxed);
    println!(
        "  {n_conns} connections, {ops_per_conn} ops each: {ok}/{n_conns} succeeded in {:.2}s",
        elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("COWORKD_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("COWORKD_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid COWORKD_PORT");
    // Must match the server's COWORKD_ADMIN_EMAIL so writes are authorized.
    let admin = std::env::var("COWORKD_ADMIN_EMAIL").unwrap_or_else(|_| "ops@example.com".into());

    println!("=== coworkd stress benchmark ===");
    println!("target: {host}:{port} as {admin}\n");

    println!("[setup]");
    let setup_client = connect(&host, port, &admin).await;
    setup(&setup_client).await;
    drop(setup_client);

    println!("\n[phase 1] sequential write throughput");
    phase1_sequential(&host, port, &admin).await;

    println!("\n[phase 2] concurrent write throughput");
    phase2_concurrent(&host, port, &admin).await;

    println!("\n[phase 3] read latency under write load");
    phase3_read_under_load(&host, port, &admin).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&host, port, &admin).await;

    println!("\n=== benchmark complete ===");
}
