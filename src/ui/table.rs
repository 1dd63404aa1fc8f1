use tabled::{settings::Style, Table, Tabled};

use crate::storage::DbStats;

#[derive(Tabled)]
pub struct TableRow {
    #[tabled(rename = "Entity")]
    pub entity: String,
    #[tabled(rename = "Rows")]
    pub rows: usize,
}

pub struct TableBuilder {
    rows: Vec<TableRow>,
}

impl TableBuilder {
    pub fn new() -> Self {
        Self { rows: Vec::new() }
    }

    pub fn add_row(&mut self, entity: &str, rows: usize) {
        self.rows.push(TableRow {
            entity: entity.to_string(),
            rows,
        });
    }

    pub fn build(&self) -> String {
        if self.rows.is_empty() {
            return String::new();
        }

        Table::new(&self.rows).with(Style::rounded()).to_string()
    }
}

impl Default for TableBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-entity row counts
pub fn stats_table(stats: &DbStats) -> String {
    let mut builder = TableBuilder::new();
    for (entity, rows) in &stats.entities {
        builder.add_row(entity, *rows);
    }
    builder.build()
}
