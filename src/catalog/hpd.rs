use super::{CatalogError, ImportType};
use crate::coordination::scheduler::{Column, ForeignKey, Schema, Table};
use crate::db::SqlType;
use crate::formats::Conversion;

/// Houston Police Department NIBRS incident extracts
pub struct HpdIncidents;

impl ImportType for HpdIncidents {
    fn key(&self) -> &str {
        "hpd"
    }

    fn name(&self) -> &str {
        "Houston Police Department"
    }

    fn schema(&self) -> Result<Schema, CatalogError> {
        let offense = Table::new("offense")
            .column(Column::new("NIBRSClass", "code", SqlType::Varchar(4)).required())
            .column(Column::new("NIBRSDescription", "literal", SqlType::Varchar(100)).required())
            .primary_key(&["code"]);

        let varchar = |raw: &str, name: &str, len: u32| Column::new(raw, name, SqlType::Varchar(len));
        let incident = Table::new("incident")
            .column(Column::new("Incident", "incident_id", SqlType::BigInt).required())
            .column(
                Column::new("RMSOccurrenceDate", "incident_date", SqlType::Date)
                    .with_conversion(Conversion::date("%Y-%m-%d"))
                    .required(),
            )
            .column(Column::new("NIBRSClass", "offense_code", SqlType::Varchar(4)).required())
            .column(Column::new("OffenseCount", "offense_count", SqlType::Integer).required())
            .column(varchar("Beat", "beat", 10))
            .column(varchar("Premise", "premise", 255))
            .column(varchar("StreetNo", "street_number", 20))
            .column(varchar("StreetName", "street_name", 255))
            .column(varchar("StreetType", "street_type", 5))
            .column(varchar("Suffix", "suffix", 1))
            .column(varchar("City", "city", 50))
            .column(varchar("ZIPCode", "zip_code", 20))
            .column(Column::new("MapLongitude", "map_longitude", SqlType::DoublePrecision))
            .column(Column::new("MapLatitude", "map_latitude", SqlType::DoublePrecision))
            .primary_key(&["incident_id"])
            .foreign_key(ForeignKey::new(&["offense_code"], "offense", &["code"]));

        let mut schema = Schema::new("hpd", false);
        let offense = schema.add_table(offense)?;
        let incident = schema.add_table(incident)?;
        schema.add_prereq(incident, offense)?;
        Ok(schema)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incident_follows_offense() {
        let schema = HpdIncidents.schema().unwrap();
        assert!(!schema.staging_required());
        let order: Vec<String> = schema
            .topological_order()
            .into_iter()
            .filter_map(|id| schema.table(id))
            .map(|t| t.name().to_string())
            .collect();
        assert_eq!(order, vec!["offense", "incident"]);

        let conversions = HpdIncidents.conversion_map().unwrap();
        assert_eq!(conversions["RMSOccurrenceDate"], Conversion::date("%Y-%m-%d"));
        assert_eq!(conversions["MapLatitude"], Conversion::Float);

        let incident = schema.table(schema.table_id("incident").unwrap()).unwrap();
        let required: Vec<&str> = incident
            .columns()
            .iter()
            .filter(|c| !c.nullable)
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(required, ["incident_id", "incident_date", "offense_code", "offense_count"]);
        let names: Vec<&str> = incident.columns()[11..].iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["zip_code", "map_longitude", "map_latitude"]);
    }
}
