use std::ops::ControlFlow;
use std::sync::Arc;

use anyhow::{bail, Context};
use futures::StreamExt;
use meld::{LwwItem, MergePolicy, TableRow, Timestamp};
use meld_http::{HttpPeer, KvClient};
use meld_replica::{spawn_sync_task, Replica};
use reqwest::Client;
use tokio::net::TcpListener;
use tracing::info;

use crate::config::{NodeConfig, PeerConfig};

type Result<T = ()> = anyhow::Result<T>;

/// `meld serve`: Serve the database and pull from every peer.
pub async fn serve(config: &NodeConfig) -> Result {
    let store = config.storage.open(config.policy)?;
    let replica = Replica::open(&config.node_id, store, config.policy)?;
    let client = Client::new();

    let tasks: Vec<_> = config
        .peers
        .iter()
        .map(|peer| {
            let transport = Arc::new(HttpPeer::new(client.clone(), &peer.addr, &config.database));
            spawn_sync_task(
                replica.syncer(),
                peer.id.clone(),
                transport,
                config.sync.task_config(),
            )
        })
        .collect();

    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("binding {}", config.listen))?;
    info!(
        node = %config.node_id,
        database = %config.database,
        policy = %config.policy,
        peers = config.peers.len(),
        "node started"
    );
    meld_http::serve(listener, meld_http::router(&config.database, replica), shutdown()).await?;

    for task in tasks {
        task.abort();
    }
    Ok(())
}

async fn shutdown() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutting down");
}

/// `meld sync [peer]`: Pull once from one peer or all of them.
pub async fn sync(config: &NodeConfig, only: Option<&str>) -> Result {
    let peers: Vec<&PeerConfig> = match only {
        Some(id) => vec![config
            .peer(id)
            .with_context(|| format!("no peer {id:?} in config"))?],
        None => config.peers.iter().collect(),
    };
    if peers.is_empty() {
        println!("  (no peers configured)");
        return Ok(());
    }

    let store = config.storage.open(config.policy)?;
    let replica = Replica::open(&config.node_id, store, config.policy)?;
    let syncer = replica.syncer();
    let client = Client::new();

    let mut failed = 0;
    for peer in peers {
        let transport = HttpPeer::new(client.clone(), &peer.addr, &config.database);
        match syncer
            .sync_with_timeout(&peer.id, &transport, config.sync.timeout())
            .await
        {
            Ok(report) => println!(
                "  {:<20} {:?}: applied {}, skipped {}, cursor {}",
                peer.id, report.status, report.applied, report.skipped, report.cursor
            ),
            Err(e) => {
                failed += 1;
                println!("  {:<20} failed: {e}", peer.id);
            }
        }
    }
    if failed > 0 {
        bail!("{failed} peer(s) failed to sync");
    }
    Ok(())
}

/// `meld status`: Show the local node's version and time vector.
pub fn status(config: &NodeConfig) -> Result {
    let store = config.storage.open(config.policy)?;
    let version = store.query_watermark(&config.node_id)?;
    let mut items = 0usize;
    store.stream(&mut |_, _| {
        items += 1;
        ControlFlow::Continue(())
    })?;

    println!(
        "Node: {} (database {:?}, {} policy, {:?} backend)",
        config.node_id, config.database, config.policy, config.storage.backend
    );
    println!("Items: {items}");
    match version {
        Some(at) => println!("Version: {at}"),
        None => println!("Version: (no writes yet)"),
    }
    println!();

    let rows = store.watermarks()?;
    if rows.is_empty() {
        println!("  (empty time vector)");
        return Ok(());
    }
    println!("  {:<20} {:>20}", "Peer", "Watermark");
    println!("  {}", "-".repeat(41));
    for (peer, at) in rows {
        let label = if peer == config.node_id {
            format!("{peer} (self)")
        } else {
            peer
        };
        println!("  {label:<20} {:>20}", at.as_nanos());
    }
    Ok(())
}

/// `meld get <key>`: Read a key from a running node.
pub async fn get(config: &NodeConfig, addr: Option<&str>, key: &str) -> Result {
    match kv_client(config, addr).obtain(key.as_bytes()).await? {
        Some(item) => {
            println!("{}", render(config.policy, &item));
            Ok(())
        }
        None => bail!("key {key:?} not found"),
    }
}

/// `meld put <key> <value>...`: Write a key on a running node.
pub async fn put(config: &NodeConfig, addr: Option<&str>, key: &str, values: &[String]) -> Result {
    let item = put_item(config.policy, values, Timestamp::now())?;
    kv_client(config, addr).submit(key.as_bytes(), item).await?;
    Ok(())
}

/// `meld delete <key>`: Write a delete for a key on a running node.
pub async fn delete(config: &NodeConfig, addr: Option<&str>, key: &str) -> Result {
    let item = delete_item(config.policy, Timestamp::now());
    kv_client(config, addr).submit(key.as_bytes(), item).await?;
    Ok(())
}

/// `meld dump`: Print every key a running node holds.
pub async fn dump(config: &NodeConfig, addr: Option<&str>) -> Result {
    let mut entries = kv_client(config, addr).stream().await?;
    let mut count = 0usize;
    while let Some(entry) = entries.next().await {
        let entry = entry?;
        println!(
            "{}\t{}",
            String::from_utf8_lossy(&entry.key),
            render(config.policy, &entry.item)
        );
        count += 1;
    }
    println!("({count} keys)");
    Ok(())
}

fn kv_client(config: &NodeConfig, addr: Option<&str>) -> KvClient {
    let addr = addr.map_or_else(|| config.listen.to_string(), str::to_string);
    KvClient::new(Client::new(), &addr, &config.database)
}

/// Build a write item: one value for LWW, `name=value` pairs for tables.
fn put_item(policy: MergePolicy, values: &[String], at: Timestamp) -> Result<Vec<u8>> {
    match policy {
        MergePolicy::LastWriteWins => {
            let [value] = values else {
                bail!("lww databases take exactly one value, got {}", values.len());
            };
            Ok(LwwItem::write(at, value.as_bytes().to_vec()).encode())
        }
        MergePolicy::Table => {
            let fields = values
                .iter()
                .map(|pair| {
                    pair.split_once('=')
                        .map(|(name, value)| (name.to_string(), value.as_bytes().to_vec()))
                        .with_context(|| format!("expected name=value, got {pair:?}"))
                })
                .collect::<Result<Vec<_>>>()?;
            if fields.is_empty() {
                bail!("table writes need at least one name=value field");
            }
            Ok(TableRow::put(fields, at).to_item())
        }
    }
}

fn delete_item(policy: MergePolicy, at: Timestamp) -> Vec<u8> {
    match policy {
        MergePolicy::LastWriteWins => LwwItem::tombstone(at).encode(),
        MergePolicy::Table => TableRow::delete(at).to_item(),
    }
}

fn render(policy: MergePolicy, item: &[u8]) -> String {
    match policy {
        MergePolicy::LastWriteWins => match LwwItem::decode(item) {
            Ok(lww) => match lww.value() {
                Some(value) => String::from_utf8_lossy(value).into_owned(),
                None => "(deleted)".to_string(),
            },
            Err(e) => format!("({e})"),
        },
        MergePolicy::Table => match TableRow::from_item(item) {
            Ok(row) if row.is_deleted() => "(deleted)".to_string(),
            Ok(row) => row
                .values()
                .map(|(name, value)| format!("{name}={}", String::from_utf8_lossy(value)))
                .collect::<Vec<_>>()
                .join(" "),
            Err(e) => format!("({e})"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn lww_put_takes_one_value() {
        let at = Timestamp::from_nanos(5);
        let item = put_item(MergePolicy::LastWriteWins, &args(&["on"]), at).unwrap();
        assert_eq!(render(MergePolicy::LastWriteWins, &item), "on");
        assert!(put_item(MergePolicy::LastWriteWins, &args(&["a", "b"]), at).is_err());
    }

    #[test]
    fn table_put_parses_fields() {
        let at = Timestamp::from_nanos(5);
        let item = put_item(MergePolicy::Table, &args(&["state=on", "room=hall"]), at).unwrap();
        assert_eq!(render(MergePolicy::Table, &item), "room=hall state=on");
        assert!(put_item(MergePolicy::Table, &args(&["no-equals"]), at).is_err());
        assert!(put_item(MergePolicy::Table, &[], at).is_err());
    }

    #[test]
    fn deletes_render_as_deleted() {
        for policy in [MergePolicy::LastWriteWins, MergePolicy::Table] {
            let item = delete_item(policy, Timestamp::from_nanos(9));
            assert_eq!(render(policy, &item), "(deleted)");
        }
    }
}
