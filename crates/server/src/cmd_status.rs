//! `pairline status`: check if the server is running and list sessions.
//! `pairline generate-token`: create a random auth token.

use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;

use crate::paths;
use crate::persistence::SqliteSessionStore;
use crate::VERSION;

pub async fn run(data_dir: &Path, bind: SocketAddr) -> anyhow::Result<()> {
    println!();
    println!("  Pairline Server v{}", VERSION);
    println!("  Data dir: {}", data_dir.display());

    let pid_path = paths::pid_file_path();
    let pid_alive = if pid_path.exists() {
        let pid_str = std::fs::read_to_string(&pid_path).unwrap_or_default();
        let pid: u32 = pid_str.trim().parse().unwrap_or(0);
        if pid > 0 && process_alive(pid) {
            println!("  PID: {} (running)", pid);
            true
        } else {
            println!("  PID file: {} (stale, process not found)", pid);
            false
        }
    } else {
        println!("  PID file: not found");
        false
    };

    let health_url = format!("http://{}/health", bind);
    let health_ok = check_health(&health_url).await;
    if health_ok {
        println!("  Health: OK ({})", health_url);
    } else if pid_alive {
        println!("  Health: unreachable (server may be binding to a different address)");
    } else {
        println!("  Health: unreachable");
    }

    let db_path = paths::db_path();
    if db_path.exists() {
        let size = std::fs::metadata(&db_path).map(|m| m.len()).unwrap_or(0);
        println!("  Database: {} ({} KB)", db_path.display(), size / 1024);
        print_sessions(&SqliteSessionStore::new(db_path));
    } else {
        println!("  Database: not found");
    }

    println!();

    if !pid_alive && !health_ok {
        println!("  Server is not running.");
        println!("  Start with: pairline start");
    }

    println!();
    Ok(())
}

fn print_sessions(store: &SqliteSessionStore) {
    let sessions = match store.list_blocking() {
        Ok(sessions) => sessions,
        Err(e) => {
            println!("  Sessions: unreadable ({})", e);
            return;
        }
    };
    if sessions.is_empty() {
        println!("  Sessions: none");
        return;
    }

    println!("  Sessions:");
    for session in sessions {
        let detail = session
            .last_error
            .as_ref()
            .map(|e| format!(" ({})", e.message))
            .unwrap_or_default();
        println!(
            "    {:<16} {:<28} {:<18} {}{}",
            session.tenant_id,
            session.instance_name,
            session.status.as_str(),
            session.updated_at.format("%Y-%m-%d %H:%M:%S"),
            detail
        );
    }
}

pub fn generate_token(data_dir: &Path) -> anyhow::Result<()> {
    let token = uuid::Uuid::new_v4().to_string();
    let token_path = paths::token_file_path();

    std::fs::create_dir_all(data_dir)?;

    std::fs::write(&token_path, &token)?;
    std::fs::set_permissions(&token_path, std::fs::Permissions::from_mode(0o600))?;

    println!();
    println!(
        "  Auth token generated and saved to {}",
        token_path.display()
    );
    println!();
    println!("  Token: {}", token);
    println!();
    println!("  Usage:");
    println!("    pairline start --auth-token {}", token);
    println!("  Or:");
    println!(
        "    pairline start --auth-token $(cat {})",
        token_path.display()
    );
    println!();

    Ok(())
}

fn process_alive(pid: u32) -> bool {
    // kill -0 checks if process exists without sending a signal
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

async fn check_health(url: &str) -> bool {
    let Ok(client) = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(1))
        .timeout(Duration::from_secs(2))
        .build()
    else {
        return false;
    };
    client
        .get(url)
        .send()
        .await
        .map(|resp| resp.status().is_success())
        .unwrap_or(false)
}
