//! Output formatting for the CLI.
//!
//! Every listing supports a human-readable table and JSON. Row types
//! implement [`Tabular`] to name their columns; JSON goes through serde.

use clap::ValueEnum;
use comfy_table::{ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
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

/// A value that can be shown as one table row.
pub trait Tabular {
    /// Column names and cell values, in display order.
    fn fields(&self) -> Vec<(&'static str, String)>;
}

/// One row of `ctrcp list`.
#[derive(Debug, Serialize)]
pub struct ContainerListEntry {
    /// Container id, truncated unless `--no-trunc`.
    pub id: String,
    /// Full container id; JSON only.
    pub full_id: String,
    /// Container name, if any.
    pub name: Option<String>,
    /// Host directory of the root filesystem.
    pub rootfs: String,
    /// Number of declared mounts.
    pub mounts: usize,
}

impl Tabular for ContainerListEntry {
    fn fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("ID", self.id.clone()),
            ("NAME", self.name.clone().unwrap_or_else(|| "<none>".to_string())),
            ("ROOTFS", self.rootfs.clone()),
            ("MOUNTS", self.mounts.to_string()),
        ]
    }
}

/// One row of `ctrcp mounts`.
#[derive(Debug, Serialize)]
pub struct MountEntry {
    /// Mount destination inside the container.
    pub container_path: String,
    /// Host storage backing it.
    pub host_path: String,
    /// `bind`, `volume` or `special-file`.
    pub kind: String,
    /// Whether the container sees it read-only.
    pub read_only: bool,
}

impl Tabular for MountEntry {
    fn fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("CONTAINER PATH", self.container_path.clone()),
            ("HOST PATH", self.host_path.clone()),
            ("KIND", self.kind.clone()),
            ("MODE", if self.read_only { "ro" } else { "rw" }.to_string()),
        ]
    }
}

/// Output of `ctrcp resolve`.
#[derive(Debug, Serialize)]
pub struct ResolveOutput {
    /// Container id.
    pub container: String,
    /// The path as given.
    pub requested: String,
    /// Symlink-free container path reached.
    pub container_path: String,
    /// Backing host path.
    pub host_path: String,
    /// Mount supplying the host path, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mount: Option<String>,
    /// Whether the host path currently exists.
    pub exists: bool,
}

impl Tabular for ResolveOutput {
    fn fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("CONTAINER", truncate_id(&self.container)),
            ("REQUESTED", self.requested.clone()),
            ("CONTAINER PATH", self.container_path.clone()),
            ("HOST PATH", self.host_path.clone()),
            ("MOUNT", self.mount.clone().unwrap_or_else(|| "-".to_string())),
        ]
    }
}

/// Truncate an ID to 12 characters for display.
pub fn truncate_id(id: &str) -> String {
    id.chars().take(12).collect()
}

/// Create a styled table with consistent formatting.
pub fn create_styled_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

/// Output a single item as a two-column key/value table or a JSON object.
pub fn output_item<T>(item: &T, format: OutputFormat) -> Result<(), serde_json::Error>
where
    T: Serialize + Tabular,
{
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string(item)?);
        }
        OutputFormat::Table => {
            let mut table = create_styled_table();
            for (key, value) in item.fields() {
                table.add_row(vec![key.to_string(), value]);
            }
            println!("{}", table);
        }
    }
    Ok(())
}

/// Output a slice of items as a columnar table or a JSON array.
pub fn output_slice<T>(items: &[T], format: OutputFormat) -> Result<(), serde_json::Error>
where
    T: Serialize + Tabular,
{
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string(items)?);
        }
        OutputFormat::Table => println!("{}", slice_table(items)),
    }
    Ok(())
}

fn slice_table<T: Tabular>(items: &[T]) -> Table {
    let mut table = create_styled_table();
    let rows: Vec<_> = items.iter().map(Tabular::fields).collect();
    if let Some(first) = rows.first() {
        table.set_header(first.iter().map(|(key, _)| *key).collect::<Vec<_>>());
    }
    for row in rows {
        table.add_row(row.into_iter().map(|(_, value)| value).collect::<Vec<_>>());
    }
    table
}
