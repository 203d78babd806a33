use anyhow::{Context, Result};
use octane::snapshot::Snapshot;
use prettytable::format::{FormatBuilder, LinePosition, LineSeparator};
use prettytable::Table;
use std::path::Path;

pub fn read_snapshot(input: &Path) -> Result<Snapshot> {
    Snapshot::load(input).with_context(|| format!("unable to read '{}'", input.display()))
}

pub fn write_snapshot(output: &Path, snapshot: &Snapshot) -> Result<()> {
    snapshot
        .save(output)
        .with_context(|| format!("unable to write '{}'", output.display()))
}

pub fn create_table() -> Table {
    let mut table = Table::new();
    table.set_format(
        FormatBuilder::new()
            .column_separator(' ')
            .separator(LinePosition::Title, LineSeparator::new('-', '+', ' ', ' '))
            .build(),
    );
    table
}
