//! Output formatting for the CLI.
//!
//! Decoded records are rendered here and nowhere else: table layout,
//! timestamp formatting, label visibility and placeholder rows for empty
//! namespaces are all presentation concerns.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL_CONDENSED, ContentArrangement, Table};
use ctrmeta_rs::{Container, Content, Image, Ingest, Lease, Namespace, NamespaceScan, Snapshot, Task};
use serde::Serialize;

/// Output format for CLI commands.
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table format.
    #[default]
    Table,
    /// Machine-parseable JSON format.
    Json,
}

/// Presentation switches shared by all listings.
#[derive(Debug, Clone, Copy, Default)]
pub struct View {
    pub labels: bool,
    pub placeholders: bool,
    pub updated: bool,
}

/// Format a timestamp with nanosecond precision, or empty if unknown.
pub fn format_timestamp(ts: Option<DateTime<Utc>>) -> String {
    ts.map(|t| t.format("%Y-%m-%dT%H:%M:%S%.9fZ").to_string())
        .unwrap_or_default()
}

/// Render labels as `k=v` pairs joined by commas.
pub fn label_string(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Format a byte count as human-readable size.
pub fn format_size(bytes: i64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = 1024.0 * KB;
    const GB: f64 = 1024.0 * MB;

    let b = bytes as f64;
    if bytes < 0 {
        format!("{} B", bytes)
    } else if b >= GB {
        format!("{:.1} GB", b / GB)
    } else if b >= MB {
        format!("{:.1} MB", b / MB)
    } else if b >= KB {
        format!("{:.1} KB", b / KB)
    } else {
        format!("{} B", bytes)
    }
}

/// Create a styled table with consistent formatting.
pub fn create_styled_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

/// Output a slice of records as a JSON array.
pub fn output_json<T: Serialize>(items: &[T]) -> Result<(), serde_json::Error> {
    println!("{}", serde_json::to_string_pretty(items)?);
    Ok(())
}

fn header(table: &mut Table, columns: &[&str], view: View) {
    let mut columns: Vec<&str> = columns.to_vec();
    if view.labels {
        columns.push("LABELS");
    }
    table.set_header(columns);
}

/// Append an UPDATED AT column to a timestamped listing when requested.
fn with_updated<'a>(columns: &[&'a str], view: View) -> Vec<&'a str> {
    let mut columns = columns.to_vec();
    if view.updated {
        columns.push("UPDATED AT");
    }
    columns
}

fn push_updated(cells: &mut Vec<String>, updated_at: Option<DateTime<Utc>>, view: View) {
    if view.updated {
        cells.push(format_timestamp(updated_at));
    }
}

fn row(table: &mut Table, mut cells: Vec<String>, labels: &BTreeMap<String, String>, view: View) {
    if view.labels {
        cells.push(label_string(labels));
    }
    table.add_row(cells);
}

fn placeholders<T>(table: &mut Table, scan: &NamespaceScan<T>, width: usize, view: View) {
    if !view.placeholders {
        return;
    }
    let width = width + usize::from(view.labels);
    for ns in scan.empty_namespaces() {
        let mut cells = vec![ns.to_string()];
        cells.resize(width, String::new());
        table.add_row(cells);
    }
}

pub fn namespaces_table(namespaces: &[Namespace], view: View) -> Table {
    let mut table = create_styled_table();
    header(&mut table, &["NAMESPACE"], view);
    for ns in namespaces {
        row(&mut table, vec![ns.name.clone()], &ns.labels, view);
    }
    table
}

pub fn containers_table(
    scan: &NamespaceScan<Container>,
    records: &[(&Container, &Task)],
    view: View,
) -> Table {
    let columns = with_updated(
        &[
            "NAMESPACE",
            "CONTAINER",
            "HOSTNAME",
            "IMAGE",
            "TYPE",
            "CREATED AT",
            "PID",
            "STATUS",
        ],
        view,
    );
    let mut table = create_styled_table();
    header(&mut table, &columns, view);
    for (c, task) in records {
        let mut cells = vec![
            c.namespace.clone(),
            c.id.clone(),
            c.hostname.clone(),
            c.image.clone(),
            c.container_type.clone(),
            format_timestamp(c.created_at),
            task.pid.to_string(),
            task.status.to_string(),
        ];
        push_updated(&mut cells, c.updated_at, view);
        row(&mut table, cells, &c.labels, view);
    }
    placeholders(&mut table, scan, columns.len(), view);
    table
}

pub fn images_table(scan: &NamespaceScan<Image>, records: &[&Image], view: View) -> Table {
    let columns = with_updated(
        &["NAMESPACE", "NAME", "CREATED AT", "DIGEST", "TYPE", "SIZE"],
        view,
    );
    let mut table = create_styled_table();
    header(&mut table, &columns, view);
    for i in records {
        let mut cells = vec![
            i.namespace.clone(),
            i.name.clone(),
            format_timestamp(i.created_at),
            i.target.digest.clone(),
            i.target.media_type.clone(),
            format_size(i.target.size),
        ];
        push_updated(&mut cells, i.updated_at, view);
        row(&mut table, cells, &i.labels, view);
    }
    placeholders(&mut table, scan, columns.len(), view);
    table
}

pub fn content_table(scan: &NamespaceScan<Content>, view: View) -> Table {
    let columns = with_updated(&["NAMESPACE", "DIGEST", "SIZE", "CREATED AT"], view);
    let mut table = create_styled_table();
    header(&mut table, &columns, view);
    for c in &scan.records {
        let mut cells = vec![
            c.namespace.clone(),
            c.digest.clone(),
            format_size(c.size),
            format_timestamp(c.created_at),
        ];
        push_updated(&mut cells, c.updated_at, view);
        row(&mut table, cells, &c.labels, view);
    }
    placeholders(&mut table, scan, columns.len(), view);
    table
}

pub fn ingests_table(ingests: &[Ingest]) -> Table {
    let mut table = create_styled_table();
    table.set_header(["NAMESPACE", "REF", "EXPECTED", "EXPIRES AT"]);
    for i in ingests {
        table.add_row([
            i.namespace.clone(),
            i.reference.clone(),
            i.expected.clone(),
            format_timestamp(i.expires_at),
        ]);
    }
    table
}

pub fn snapshots_table(scan: &NamespaceScan<Snapshot>, view: View) -> Table {
    let columns = with_updated(
        &[
            "NAMESPACE",
            "SNAPSHOTTER",
            "CREATED AT",
            "KIND",
            "NAME",
            "PARENT",
            "FSPATH",
        ],
        view,
    );
    let mut table = create_styled_table();
    header(&mut table, &columns, view);
    for s in &scan.records {
        let mut cells = vec![
            s.namespace.clone(),
            s.snapshotter.clone(),
            format_timestamp(s.created_at),
            s.kind.to_string(),
            s.key.clone(),
            s.parent.clone(),
            s.overlay_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
        ];
        push_updated(&mut cells, s.updated_at, view);
        row(&mut table, cells, &s.labels, view);
    }
    placeholders(&mut table, scan, columns.len(), view);
    table
}

fn resource_count(lease: &Lease) -> usize {
    let count = |key: &str| {
        lease
            .get(key)
            .and_then(|v| v.as_array())
            .map_or(0, Vec::len)
    };
    let snapshots = lease
        .get("Snapshots")
        .and_then(|v| v.as_object())
        .map_or(0, |m| {
            m.values()
                .filter_map(|v| v.as_array())
                .map(Vec::len)
                .sum()
        });
    count("Content") + count("Ingests") + snapshots
}

pub fn leases_table(scan: &NamespaceScan<Lease>) -> Table {
    let mut table = create_styled_table();
    table.set_header(["NAMESPACE", "ID", "CREATED AT", "RESOURCES"]);
    for lease in &scan.records {
        let created = lease
            .get("CreatedAt")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        table.add_row([
            lease.namespace().to_string(),
            lease.id().to_string(),
            created,
            resource_count(lease).to_string(),
        ]);
    }
    table
}

pub fn tasks_table(records: &[&Task]) -> Table {
    let mut table = create_styled_table();
    table.set_header(["NAMESPACE", "CONTAINER", "TYPE", "PID", "STATUS"]);
    for t in records {
        table.add_row([
            t.namespace.clone(),
            t.container_id.clone(),
            t.container_type.clone(),
            t.pid.to_string(),
            t.status.to_string(),
        ]);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_timestamp() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(format_timestamp(Some(ts)), "2024-01-02T03:04:05.000000000Z");
        assert_eq!(format_timestamp(None), "");
    }

    #[test]
    fn test_label_string() {
        let mut labels = BTreeMap::new();
        assert_eq!(label_string(&labels), "");
        labels.insert("b".to_string(), "2".to_string());
        labels.insert("a".to_string(), "1".to_string());
        assert_eq!(label_string(&labels), "a=1,b=2");
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(1023), "1023 B");
        assert_eq!(format_size(1536), "1.5 KB");
        assert_eq!(format_size(1_500_000), "1.4 MB");
        assert_eq!(format_size(-1), "-1 B");
    }

    #[test]
    fn test_placeholder_rows() {
        let scan: NamespaceScan<Content> = NamespaceScan {
            records: Vec::new(),
            namespaces: vec![ctrmeta_rs::NamespaceOutcome {
                namespace: "empty".to_string(),
                outcome: ctrmeta_rs::Outcome::Empty,
            }],
        };
        let view = View {
            placeholders: true,
            ..View::default()
        };
        let rendered = content_table(&scan, view).to_string();
        assert!(rendered.contains("empty"));
        let hidden = content_table(&scan, View::default()).to_string();
        assert!(!hidden.contains("empty"));
    }

    #[test]
    fn test_updated_column() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap();
        let scan = NamespaceScan {
            records: vec![Content {
                namespace: "default".to_string(),
                digest: "sha256:abc".to_string(),
                size: 10,
                created_at: None,
                updated_at: Some(ts),
                labels: BTreeMap::new(),
            }],
            namespaces: Vec::new(),
        };
        let plain = content_table(&scan, View::default()).to_string();
        assert!(!plain.contains("UPDATED AT"));
        assert!(!plain.contains("2024-05-06"));

        let view = View {
            updated: true,
            ..View::default()
        };
        let rendered = content_table(&scan, view).to_string();
        assert!(rendered.contains("UPDATED AT"));
        assert!(rendered.contains("2024-05-06T07:08:09.000000000Z"));
    }
}
