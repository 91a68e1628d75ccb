use super::{CatalogError, ImportType};
use crate::coordination::scheduler::{Column, ForeignKey, Schema, Table};
use crate::db::SqlType;
use crate::formats::Conversion;

/// Harris County District Clerk criminal case snapshot.
///
/// Every row of a snapshot describes one case together with its offense,
/// attorney, report, defendant and disposition event, so the same entities
/// repeat across rows. Rows are staged first and merged once per table.
pub struct HcdcSnapshot;

fn spn(raw_name: &str, name: &str) -> Column {
    Column::new(raw_name, name, SqlType::Varchar(8)).with_conversion(Conversion::Spn)
}

fn offense() -> Table {
    Table::new("offense")
        .column(Column::new("curr_off", "id", SqlType::Integer).required())
        .column(Column::new("curr_off_lit", "literal", SqlType::Varchar(255)))
        .primary_key(&["id"])
}

fn attorney() -> Table {
    Table::new("attorney")
        .column(spn("aty_spn", "spn").required())
        .column(Column::new("aty_nam", "name", SqlType::Varchar(255)))
        .primary_key(&["spn"])
}

fn report() -> Table {
    Table::new("report")
        .column(Column::new("off_rpt_num", "id", SqlType::Varchar(25)).required())
        .column(Column::new("comp_agency", "agency", SqlType::Varchar(50)))
        .column(Column::new("comp_nam", "name", SqlType::Varchar(50)))
        .primary_key(&["id"])
}

fn defendant() -> Table {
    Table::new("defendant")
        .column(spn("def_spn", "spn").required())
        .column(Column::new("def_nam", "name", SqlType::Varchar(255)))
        .column(Column::new("def_rac", "race", SqlType::Varchar(1)))
        .column(Column::new("def_sex", "sex", SqlType::Varchar(1)))
        .column(Column::new("def_dob", "date_of_birth", SqlType::Date))
        .column(Column::new("def_stnum", "street_number", SqlType::Varchar(10)))
        .column(Column::new("def_stnam", "street_name", SqlType::Varchar(50)))
        .column(Column::new("def_cty", "city", SqlType::Varchar(50)))
        .column(Column::new("def_st", "state", SqlType::Varchar(2)))
        .column(Column::new("def_zip", "zip", SqlType::Varchar(10)))
        .column(Column::new("def_citizen", "citizen", SqlType::Varchar(2)))
        .primary_key(&["spn"])
}

fn event() -> Table {
    Table::new("event")
        .column(Column::new("cas", "case_id", SqlType::BigInt).required())
        .column(Column::new("cdi", "case_type_id", SqlType::SmallInt).required())
        .column(Column::new("disposition", "disposition", SqlType::Varchar(60)))
        .column(Column::new("cad", "disposition_code", SqlType::Varchar(4)))
        .column(Column::new("sentence", "sentence", SqlType::Varchar(60)))
        .column(Column::new("dispdt", "disposition_date", SqlType::Date))
        .column(Column::new("bamexp", "bond_explanation", SqlType::Varchar(60)))
        .column(Column::new("bam", "bond_amount", SqlType::Varchar(20)))
        .primary_key(&["case_id", "case_type_id"])
}

fn cases() -> Table {
    Table::new("cases")
        .column(Column::new("cas", "id", SqlType::BigInt).required())
        .column(Column::new("cdi", "case_type_id", SqlType::SmallInt).required())
        .column(Column::new("off_rpt_num", "report_id", SqlType::Varchar(25)))
        .column(Column::new("curr_off", "offense_id", SqlType::Integer))
        .column(spn("def_spn", "defendant_spn"))
        .column(Column::new("cst", "case_status_id", SqlType::Varchar(1)))
        .column(Column::new("dst", "defendant_status_id", SqlType::Varchar(1)))
        .column(spn("aty_spn", "attorney_spn"))
        .column(Column::new("crt", "court", SqlType::SmallInt))
        .column(Column::new("fda", "filing_date", SqlType::Date))
        .primary_key(&["id", "case_type_id"])
        .foreign_key(ForeignKey::new(&["offense_id"], "offense", &["id"]))
        .foreign_key(ForeignKey::new(&["defendant_spn"], "defendant", &["spn"]))
        .foreign_key(ForeignKey::new(&["attorney_spn"], "attorney", &["spn"]))
        .foreign_key(ForeignKey::new(&["report_id"], "report", &["id"]))
        .foreign_key(ForeignKey::new(
            &["id", "case_type_id"],
            "event",
            &["case_id", "case_type_id"],
        ))
}

impl ImportType for HcdcSnapshot {
    fn key(&self) -> &str {
        "hcdc"
    }

    fn name(&self) -> &str {
        "Harris County District Clerk"
    }

    fn schema(&self) -> Result<Schema, CatalogError> {
        let mut schema = Schema::new("hcdc", true);
        let offense = schema.add_table(offense())?;
        let attorney = schema.add_table(attorney())?;
        let report = schema.add_table(report())?;
        let defendant = schema.add_table(defendant())?;
        let event = schema.add_table(event())?;
        let cases = schema.add_table(cases())?;

        for prereq in [offense, attorney, defendant, event, report] {
            schema.add_prereq(cases, prereq)?;
        }
        Ok(schema)
    }
}
