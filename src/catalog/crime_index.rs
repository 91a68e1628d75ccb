use super::{CatalogError, ImportType};
use crate::coordination::scheduler::{Column, Schema, Table};
use crate::db::SqlType;

/// Monthly crime index counts, one row per category and reporting period
pub struct CrimeIndex;

impl ImportType for CrimeIndex {
    fn key(&self) -> &str {
        "ci"
    }

    fn name(&self) -> &str {
        "Crime Index"
    }

    fn schema(&self) -> Result<Schema, CatalogError> {
        let data = Table::new("data")
            .column(Column::new("Year", "year", SqlType::SmallInt).required())
            .column(Column::new("Month", "month", SqlType::SmallInt).required())
            .column(Column::new("Type", "type", SqlType::Varchar(20)).required())
            .column(Column::new("Reporting Year", "reportingYear", SqlType::SmallInt).required())
            .column(Column::new("Reporting Month", "reportingMonth", SqlType::SmallInt).required())
            .column(Column::new("Category", "category", SqlType::Varchar(50)).required())
            .column(Column::new("Count", "count", SqlType::Integer))
            .primary_key(&[
                "year",
                "month",
                "type",
                "reportingYear",
                "reportingMonth",
                "category",
            ]);

        let mut schema = Schema::new("ci", false);
        schema.add_table(data)?;
        Ok(schema)
    }
}
