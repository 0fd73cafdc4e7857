//! `pairline qr`: print a waiting session's pairing code as a terminal QR.

use anyhow::Context;
use qrcode::render::unicode;
use qrcode::QrCode;

use crate::paths;
use crate::persistence::SqliteSessionStore;

pub fn run(tenant_id: &str, instance_name: &str) -> anyhow::Result<()> {
    let store = SqliteSessionStore::new(paths::db_path());
    let session = store
        .get_blocking(tenant_id, instance_name)?
        .with_context(|| format!("no session {}/{}", tenant_id, instance_name))?;

    println!();
    println!(
        "  {}/{} is {}",
        session.tenant_id, session.instance_name, session.status
    );

    let Some(payload) = session.qr_payload else {
        println!("  No pairing code available.");
        println!();
        return Ok(());
    };

    match render(&payload) {
        Some(rendered) => {
            println!();
            println!("{}", rendered);
            if let Some(issued) = session.qr_issued_at {
                println!("  Issued at {}", issued.to_rfc3339());
            }
        }
        None => {
            println!("  The gateway returned an image; open it from the API instead:");
            println!("    GET /api/tenants/{}/pairing/{}", tenant_id, instance_name);
        }
    }
    println!();
    Ok(())
}

/// Image payloads are already rendered by the gateway and are not re-encoded.
fn render(payload: &str) -> Option<String> {
    if payload.starts_with("data:") {
        return None;
    }
    let code = QrCode::new(payload.as_bytes()).ok()?;
    Some(
        code.render::<unicode::Dense1x2>()
            .dark_color(unicode::Dense1x2::Light)
            .light_color(unicode::Dense1x2::Dark)
            .build(),
    )
}
