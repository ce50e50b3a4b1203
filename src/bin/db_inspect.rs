use ruggine_notify::server::config::ServerConfig;
use ruggine_notify::server::database::Database;
use sqlx::Row;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let db_path = std::env::args().nth(1).unwrap_or_else(|| ServerConfig::from_env().database_url);
    println!("Connecting to {}", db_path);
    let db = Database::connect(&db_path).await?;

    println!("\n-- presence --");
    let rows = sqlx::query(
        "SELECT p.user_id, u.username, p.status, p.status_message, p.is_available_for_chat, p.last_seen
         FROM presence p LEFT JOIN users u ON u.id = p.user_id ORDER BY p.user_id",
    )
    .fetch_all(&db.pool)
    .await?;
    for r in rows.iter() {
        let user_id: i64 = r.try_get("user_id").unwrap_or(0);
        let username: Option<String> = r.try_get("username").unwrap_or_default();
        let status: String = r.try_get("status").unwrap_or_default();
        let status_message: Option<String> = r.try_get("status_message").unwrap_or_default();
        let available: i64 = r.try_get("is_available_for_chat").unwrap_or(0);
        let last_seen: i64 = r.try_get("last_seen").unwrap_or(0);
        println!(
            "user_id={} username={} status={} message={} available={} last_seen={}",
            user_id,
            username.unwrap_or_default(),
            status,
            status_message.unwrap_or_default(),
            available != 0,
            last_seen
        );
    }

    println!("\n-- pending messages (oldest 20) --");
    let rows = sqlx::query(
        "SELECT id, sender_id, receiver_id, kind, title, body, created_at FROM messages
         WHERE is_delivered = 0 ORDER BY created_at ASC, id ASC LIMIT 20",
    )
    .fetch_all(&db.pool)
    .await?;
    for r in rows.iter() {
        let id: i64 = r.try_get("id").unwrap_or(0);
        let sender_id: Option<i64> = r.try_get("sender_id").unwrap_or_default();
        let receiver_id: i64 = r.try_get("receiver_id").unwrap_or(0);
        let kind: String = r.try_get("kind").unwrap_or_default();
        let title: Option<String> = r.try_get("title").unwrap_or_default();
        let body: String = r.try_get("body").unwrap_or_default();
        let created_at: i64 = r.try_get("created_at").unwrap_or(0);
        println!(
            "id={} kind={} from={} to={} title={} body_len={} created_at={}",
            id,
            kind,
            sender_id.map(|s| s.to_string()).unwrap_or_else(|| "system".into()),
            receiver_id,
            title.unwrap_or_default(),
            body.len(),
            created_at
        );
    }

    println!("\n-- device_tokens --");
    let rows = sqlx::query("SELECT token, user_id, platform, registered_at FROM device_tokens ORDER BY user_id")
        .fetch_all(&db.pool)
        .await?;
    for r in rows.iter() {
        let token: String = r.try_get("token").unwrap_or_default();
        let user_id: i64 = r.try_get("user_id").unwrap_or(0);
        let platform: String = r.try_get("platform").unwrap_or_default();
        let registered_at: i64 = r.try_get("registered_at").unwrap_or(0);
        let shown: String = token.chars().take(8).collect();
        println!("user_id={} platform={} token={}... registered_at={}", user_id, platform, shown, registered_at);
    }

    println!("\n-- scheduled_notifications --");
    let rows = sqlx::query("SELECT id, job_type, deliver_at FROM scheduled_notifications ORDER BY deliver_at")
        .fetch_all(&db.pool)
        .await?;
    for r in rows.iter() {
        let id: String = r.try_get("id").unwrap_or_default();
        let job_type: String = r.try_get("job_type").unwrap_or_default();
        let deliver_at: i64 = r.try_get("deliver_at").unwrap_or(0);
        println!("id={} job_type={} deliver_at={}", id, job_type, deliver_at);
    }

    Ok(())
}
