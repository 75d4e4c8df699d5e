use arbor::{Entry, RetrievedEntry, Tier};
use chrono::{DateTime, Utc};
use comfy_table::{ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use serde::Serialize;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, Default)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}

/// JSON shape of an entry in command output
#[derive(Debug, Serialize)]
pub struct EntryView<'a> {
    pub tier: Tier,
    #[serde(flatten)]
    pub entry: &'a Entry,
}

impl<'a> From<&'a RetrievedEntry> for EntryView<'a> {
    fn from(found: &'a RetrievedEntry) -> Self {
        Self {
            tier: found.tier,
            entry: &found.entry,
        }
    }
}

pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}

pub fn format_timestamp(dt: &DateTime<Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M").to_string()
}

pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * 1024;
    const GB: u64 = 1024 * 1024 * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

pub fn parse_id(id: &str) -> Result<Uuid, String> {
    Uuid::parse_str(id).map_err(|e| format!("Invalid UUID format: {e}"))
}

pub fn new_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

/// One row per entry, newest first as given
pub fn entries_table(entries: &[RetrievedEntry]) -> Table {
    let mut table = new_table();
    table.set_header(["ID", "Content", "Category", "Tier", "Accesses", "Created"]);

    for found in entries {
        let entry = &found.entry;
        table.add_row([
            truncate_string(&entry.id.to_string(), 8),
            truncate_string(&entry.content, 50),
            entry.category.to_string(),
            found.tier.to_string(),
            entry.access_count.to_string(),
            format_timestamp(&entry.created_at),
        ]);
    }
    table
}

/// Property/value listing of a single entry
pub fn entry_detail_table(found: &RetrievedEntry) -> Table {
    let entry = &found.entry;
    let mut table = new_table();
    table.set_header(["Property", "Value"]);

    let tags: Vec<&str> = entry.tags.iter().map(String::as_str).collect();
    let children: Vec<String> = entry.children_ids.iter().map(Uuid::to_string).collect();

    table.add_row(["ID", &entry.id.to_string()]);
    table.add_row(["Content", &entry.content]);
    table.add_row(["Category", entry.category.as_str()]);
    table.add_row(["Tier", &found.tier.to_string()]);
    table.add_row(["Tags", &tags.join(", ")]);
    table.add_row(["Structural Weight", &format!("{:.4}", entry.structural_weight)]);
    table.add_row(["Resonance", &format!("{:.4}", entry.resonance)]);
    table.add_row([
        "Emotion",
        &format!(
            "intensity {:.2}, valence {:+.2}",
            entry.emotional_intensity, entry.emotional_valence
        ),
    ]);
    table.add_row(["Access Count", &entry.access_count.to_string()]);
    table.add_row(["Created", &entry.created_at.to_rfc3339()]);
    table.add_row(["Updated", &entry.updated_at.to_rfc3339()]);
    table.add_row(["Last Accessed", &entry.last_accessed_at.to_rfc3339()]);
    table.add_row([
        "Archived Version",
        &entry
            .archived_version
            .map(|v| v.to_rfc3339())
            .unwrap_or_else(|| "-".to_string()),
    ]);
    table.add_row([
        "Parent",
        &entry
            .parent_id
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string()),
    ]);
    table.add_row(["Children", &children.join(", ")]);
    table.add_row(["Summary", entry.summary.as_deref().unwrap_or("-")]);
    table
}
