//! Integration tests for the insertion pipeline
//!
//! These tests load real delimited files into file-backed SQLite databases
//! through the pool, the dispatcher and its worker threads.

#[cfg(test)]
mod tests {
    use crate::{
        catalog::{HcdcSnapshot, ImportType},
        config::{ConnectionConfig, ConnectionConfigBuilder, LoadConfigBuilder, RetryPolicy},
        coordination::{Coordinator, InsertionState, scheduler::TableStatus},
        db::{Backend, Connection, ConnectionPool},
        formats::{DelimitedConfig, Frame},
        runner::{LoadArgs, plan_load, run_load},
    };
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, mpsc};
    use tempfile::TempDir;

    // ============ Test Helpers ============

    const HCDC_COLUMNS: &[&str] = &[
        "cas", "cdi", "fda", "cst", "dst", "crt", "curr_off", "curr_off_lit", "off_rpt_num",
        "comp_agency", "comp_nam", "def_spn", "def_nam", "def_rac", "def_sex", "def_dob",
        "def_stnum", "def_stnam", "def_cty", "def_st", "def_zip", "def_citizen", "aty_spn",
        "aty_nam", "disposition", "cad", "sentence", "dispdt", "bamexp", "bam",
    ];

    /// One snapshot row: 3 distinct offenses, 4 defendants, 2 attorneys and 5
    /// reports repeat across cases
    fn hcdc_row(i: usize) -> String {
        let offense = 10 + i % 3;
        let fields: Vec<String> = vec![
            (1000 + i).to_string(),
            "3".to_string(),
            "20240105".to_string(),
            "A".to_string(),
            "B".to_string(),
            "177".to_string(),
            offense.to_string(),
            format!("OFFENSE {offense}"),
            format!("R{}", i % 5),
            "HOUSTON PD".to_string(),
            "OFFICER".to_string(),
            format!("{}", 500 + i % 4),
            format!("DOE, JOHN {}", i % 4),
            "W".to_string(),
            "M".to_string(),
            "19800101".to_string(),
            "100".to_string(),
            "MAIN".to_string(),
            "HOUSTON".to_string(),
            "TX".to_string(),
            "77002".to_string(),
            "Y".to_string(),
            format!("{}", 900 + i % 2),
            format!("COUNSEL {}", i % 2),
            "DISMISSED".to_string(),
            "DISM".to_string(),
            "".to_string(),
            "20240301".to_string(),
            "".to_string(),
            "5000".to_string(),
        ];
        fields.join("\t")
    }

    fn write_file(dir: &TempDir, filename: &str, lines: &[String]) -> PathBuf {
        let path = dir.path().join(filename);
        std::fs::write(&path, lines.join("\n") + "\n").unwrap();
        path
    }

    fn write_hcdc(dir: &TempDir, filename: &str, rows: impl Iterator<Item = usize>) -> PathBuf {
        let mut lines = vec![HCDC_COLUMNS.join("\t")];
        lines.extend(rows.map(hcdc_row));
        write_file(dir, filename, &lines)
    }

    fn write_hpd(dir: &TempDir, filename: &str) -> PathBuf {
        let mut lines = vec![
            "Incident,RMSOccurrenceDate,NIBRSClass,NIBRSDescription,OffenseCount,Beat,Premise,\
             StreetNo,StreetName,StreetType,Suffix,City,ZIPCode,MapLongitude,MapLatitude"
                .to_string(),
        ];
        for i in 0..6 {
            let (class, description) = if i % 2 == 0 {
                ("13A", "Aggravated Assault")
            } else {
                ("23F", "Theft from motor vehicle")
            };
            lines.push(format!(
                "{},2024-02-{:02},{class},{description},1,10H{i},Residence,{},MAIN,ST,,HOUSTON,77002,-95.36,29.76",
                25_000_000 + i,
                i + 1,
                100 + i
            ));
        }
        write_file(dir, filename, &lines)
    }

    fn sqlite_args(db: &Path, import_type: &str, files: Vec<PathBuf>) -> LoadArgs {
        LoadArgs {
            files,
            import_type: Some(import_type.to_string()),
            driver: "sqlite".to_string(),
            database: db.to_string_lossy().to_string(),
            batch_size: 5,
            create_tables: true,
            quiet: true,
            ..LoadArgs::default()
        }
    }

    fn sqlite_config(db: &Path, max_connections: usize) -> ConnectionConfig {
        ConnectionConfigBuilder::default()
            .backend(Backend::Sqlite)
            .database(db.to_string_lossy().to_string())
            .max_connections(max_connections)
            .build()
            .unwrap()
    }

    /// Row counts of the given tables in the `main` schema
    fn counts(db: &Path, tables: &[&str]) -> Vec<i64> {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let mut conn = Connection::open(0, &sqlite_config(db, 1), runtime.handle()).unwrap();
        let counts = tables
            .iter()
            .map(|t| conn.count_rows(&Backend::Sqlite.qualify("main", t)).unwrap())
            .collect();
        conn.close().unwrap();
        counts
    }

    const HCDC_TABLES: &[&str] = &["offense", "attorney", "report", "defendant", "event", "cases"];

    // ============ Staged loads ============

    #[test]
    fn test_staged_load_populates_every_table() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("court.db");
        let file = write_hcdc(&dir, "snapshot.txt", 0..12);

        let result = run_load(sqlite_args(&db, "hcdc", vec![file])).unwrap();

        assert_eq!(result.import_type, "hcdc");
        assert_eq!(result.files_loaded, 1);
        assert_eq!(result.rows_read, 12);
        assert_eq!(result.tables_created, 12);
        assert_eq!(counts(&db, HCDC_TABLES), vec![3, 2, 5, 4, 12, 12]);

        // Staging tables keep the last file's rows, duplicates included
        assert_eq!(counts(&db, &["stage_offense", "stage_cases"]), vec![12, 12]);
    }

    #[test]
    fn test_rerun_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("court.db");
        let file = write_hcdc(&dir, "snapshot.txt", 0..12);

        let first = run_load(sqlite_args(&db, "hcdc", vec![file.clone()])).unwrap();
        let second = run_load(sqlite_args(&db, "hcdc", vec![file])).unwrap();

        assert_eq!(counts(&db, HCDC_TABLES), vec![3, 2, 5, 4, 12, 12]);
        // Staging truncation restarts the surrogate key, so the merge spans
        // the same ranges on both runs
        assert_eq!(first.statements, second.statements);
        assert!(second.rows_affected < first.rows_affected);
        assert_eq!(counts(&db, &["stage_cases"]), vec![12]);
    }

    #[test]
    fn test_files_load_sequentially_with_overlap() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("court.db");
        let first = write_hcdc(&dir, "monday.txt", 0..8);
        let second = write_hcdc(&dir, "tuesday.txt", 4..16);

        let result = run_load(sqlite_args(&db, "hcdc", vec![first, second])).unwrap();

        assert_eq!(result.files_loaded, 2);
        assert_eq!(result.rows_read, 20);
        assert_eq!(counts(&db, &["cases", "event", "stage_cases"]), vec![16, 16, 12]);
    }

    #[test]
    fn test_single_and_two_connection_pools() {
        for max_connections in [1, 2] {
            let dir = TempDir::new().unwrap();
            let db = dir.path().join("court.db");
            let file = write_hcdc(&dir, "snapshot.txt", 0..9);

            let args = LoadArgs {
                max_connections,
                batch_size: 2,
                ..sqlite_args(&db, "hcdc", vec![file])
            };
            run_load(args).unwrap();

            assert_eq!(counts(&db, HCDC_TABLES), vec![3, 2, 5, 4, 9, 9]);
        }
    }

    // ============ Direct insertion ============

    #[test]
    fn test_direct_insertion_skips_staging() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("police.db");
        let file = write_hpd(&dir, "nibrs.csv");

        let result = run_load(sqlite_args(&db, "hpd", vec![file.clone()])).unwrap();
        assert_eq!(result.tables_created, 2);
        assert_eq!(counts(&db, &["offense", "incident"]), vec![2, 6]);

        // Conflicting rows are ignored on a second pass
        let again = run_load(sqlite_args(&db, "hpd", vec![file])).unwrap();
        assert_eq!(again.rows_affected, 0);
        assert_eq!(counts(&db, &["offense", "incident"]), vec![2, 6]);
    }

    #[test]
    fn test_latin1_extract_loads_with_encoding() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("police.db");
        let header = b"Incident,RMSOccurrenceDate,NIBRSClass,NIBRSDescription,OffenseCount,Beat,Premise,\
StreetNo,StreetName,StreetType,Suffix,City,ZIPCode,MapLongitude,MapLatitude\n";
        let mut content = header.to_vec();
        content.extend_from_slice(
            b"25000001,2024-02-01,13A,Aggravated Assault,1,10H1,Caf\xe9,100,MAIN,ST,,HOUSTON,77002,-95.36,29.76\n",
        );
        let file = dir.path().join("nibrs.csv");
        std::fs::write(&file, content).unwrap();

        let err = run_load(sqlite_args(&db, "hpd", vec![file.clone()])).unwrap_err();
        assert!(format!("{err:#}").contains("invalid UTF-8"));

        let args = LoadArgs {
            encoding: "latin1".to_string(),
            ..sqlite_args(&db, "hpd", vec![file])
        };
        run_load(args).unwrap();
        assert_eq!(counts(&db, &["offense", "incident"]), vec![1, 1]);
    }

    #[test]
    fn test_custom_catalog_load() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("custom.db");
        let catalog = dir.path().join("warrants.json");
        std::fs::write(
            &catalog,
            r#"{
                "key": "warrants",
                "name": "Open Warrants",
                "staging_required": true,
                "tables": [{
                    "name": "warrant",
                    "columns": [
                        {"raw_name": "id", "name": "id", "type": "big_int", "nullable": false},
                        {"raw_name": "issued", "name": "issued_on", "type": "date",
                         "conversion": {"kind": "date", "format": "%m/%d/%Y"}}
                    ],
                    "primary_key": ["id"]
                }]
            }"#,
        )
        .unwrap();
        let file = write_file(
            &dir,
            "warrants.csv",
            &["id,issued".into(), "1,01/31/2024".into(), "2,02/01/2024".into(), "1,01/31/2024".into()],
        );

        let args = LoadArgs {
            import_type: None,
            catalog: Some(catalog),
            ..sqlite_args(&db, "", vec![file])
        };
        let result = run_load(args).unwrap();
        assert_eq!(result.import_type, "warrants");
        assert_eq!(counts(&db, &["warrant", "stage_warrant"]), vec![2, 3]);
    }

    // ============ Failures ============

    #[test]
    fn test_missing_required_column_fails_before_loading() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("police.db");
        let file = write_file(&dir, "partial.csv", &["Incident,NIBRSClass".into(), "1,13A".into()]);

        let err = run_load(sqlite_args(&db, "hpd", vec![file])).unwrap_err();
        assert!(format!("{err:#}").contains("is missing from the source file"));
        assert_eq!(counts(&db, &["offense", "incident"]), vec![0, 0]);
    }

    #[test]
    fn test_merge_fault_aborts_dependent_tables() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("court.db");
        let mut lines = vec![HCDC_COLUMNS.join("\t")];
        lines.extend((0..6).map(hcdc_row));
        // A complainant agency without a report number lands a NULL key in staging
        let mut broken: Vec<String> = hcdc_row(6).split('\t').map(str::to_string).collect();
        broken[8] = String::new();
        lines.push(broken.join("\t"));
        let file = write_file(&dir, "broken.txt", &lines);

        let args = LoadArgs {
            max_connections: 1,
            max_retries: 0,
            ..sqlite_args(&db, "hcdc", vec![file])
        };
        let err = run_load(args).unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("merging phase"), "{message}");
        assert!(message.contains("'report'"), "{message}");

        // cases depends on report and is never merged
        assert_eq!(counts(&db, &["cases"]), vec![0]);
    }

    // ============ Coordinator ============

    #[test]
    fn test_coordinator_resets_schema_and_empties_pool() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("court.db");
        let path = write_hcdc(&dir, "snapshot.txt", 0..7);
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let mut pool = ConnectionPool::new(sqlite_config(&db, 3), runtime.handle().clone());

        pool.add_connection().unwrap();
        let mut conn = pool.get_available_connection().unwrap();
        HcdcSnapshot
            .create(&mut conn, Backend::Sqlite, "main", &RetryPolicy::immediate(0))
            .unwrap();
        pool.free_connection(conn).unwrap();

        let mut schema = HcdcSnapshot.schema().unwrap();
        let frame = Frame::read_delimited(&path, &DelimitedConfig::tsv())
            .unwrap()
            .convert(&HcdcSnapshot.conversion_map().unwrap())
            .unwrap();

        let (tx, rx) = mpsc::channel();
        let config = LoadConfigBuilder::default()
            .batch_size(3)
            .retry(RetryPolicy::immediate(3))
            .build()
            .unwrap();
        let mut coordinator = Coordinator::new(config, "main", tx);
        let reports = coordinator.run(&mut schema, &mut pool, Arc::new(frame)).unwrap();

        assert_eq!(coordinator.state(), InsertionState::End);
        assert_eq!(
            reports.iter().map(|r| r.phase).collect::<Vec<_>>(),
            vec![InsertionState::Staging, InsertionState::Merging]
        );
        assert!(reports.iter().all(|r| r.tables == 6));
        // Seven rows in batches of three: three statements per staged table
        assert_eq!(reports[0].statements, 18);
        assert!(pool.is_empty());
        assert!(schema.tables().all(|t| schema.status(t.id) == Some(TableStatus::Pending)));

        drop(coordinator);
        let completions = rx
            .iter()
            .filter(|e| matches!(e, crate::telemetry::TelemetryEvent::TableCompleted { .. }))
            .count();
        assert_eq!(completions, 12);
        assert_eq!(counts(&db, HCDC_TABLES), vec![3, 2, 5, 4, 7, 7]);
    }

    // ============ Dry run ============

    #[test]
    fn test_plan_lists_tables_in_dependency_order() {
        let dir = TempDir::new().unwrap();
        let file = write_hcdc(&dir, "snapshot.txt", 0..4);

        let plan = plan_load(&LoadArgs {
            files: vec![file.clone()],
            import_type: Some("hcdc".to_string()),
            ..LoadArgs::default()
        })
        .unwrap();

        assert_eq!(plan.phases, vec!["staging", "merging"]);
        let (last, prereqs) = plan.tables.last().unwrap();
        assert_eq!(last, "cases");
        assert_eq!(prereqs.len(), 5);
        assert_eq!(plan.files, vec![(file, 4)]);
        assert!(plan.to_string().contains("cases (after"));
    }
}
