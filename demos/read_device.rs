//! Read device info and attendance logs from a ZKTeco terminal.
//!
//! Usage: cargo run --example read_device [IP] [PORT]
//!
//! Default IP: 192.168.1.201

use zkteco_client::ZkClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let ip = std::env::args().nth(1).unwrap_or_else(|| "192.168.1.201".to_string());
    let port: u16 = std::env::args().nth(2).and_then(|s| s.parse().ok()).unwrap_or(4370);

    println!("Connecting to {ip}:{port}");
    println!("======================================");

    let mut client = ZkClient::new(&ip, port, 10_000, 5200);

    println!("\n[1] Connecting...");
    client.connect().await?;
    println!("    Connected via {:?} ({})", client.connection_type().unwrap(), client.socket_status());

    println!("\n[2] Device metadata...");
    match client.get_serial_number().await {
        Ok(serial) => println!("    Serial: {serial}"),
        Err(e) => println!("    Warning: no serial number: {e}"),
    }
    match client.get_time().await {
        Ok(time) => println!("    Device clock: {time}"),
        Err(e) => println!("    Warning: no device time: {e}"),
    }

    println!("\n[3] Counters...");
    let info = client.get_info().await?;
    println!(
        "    {} users, {} / {} attendance records",
        info.user_counts, info.log_counts, info.log_capacity
    );

    println!("\n[4] Downloading attendance data...");
    let mut last_pct = 0;
    let mut progress = move |received: usize, total: usize| {
        if total == 0 {
            return;
        }
        let pct = received * 100 / total;
        if pct >= last_pct + 10 {
            last_pct = pct;
            println!("    ... {pct}%");
        }
    };
    let records = client.get_attendances(Some(&mut progress)).await?;
    println!("    Downloaded {} records", records.len());

    for record in records.iter().take(5) {
        println!(
            "      UID {:>9} | {}",
            record.device_user_id,
            record.record_time.format("%Y-%m-%d %H:%M:%S")
        );
    }

    println!("\n[5] Disconnecting...");
    client.disconnect().await?;
    println!("    Done.");

    Ok(())
}
