//! # Wasted Space and Defragmentation Tests
//!
//! Tombstone accounting and the compaction path: counters after deletions,
//! full reclamation through `defragment`, and reference patching across
//! tables while handles are reassigned.

use mypal::{
    Catalog, DbStructure, FieldDef, FieldType, Record, RecordHandle, StoreConfig, Value,
};
use tempfile::tempdir;

fn single_table_catalog() -> Catalog {
    let mut catalog = Catalog::new("primary").unwrap();
    catalog
        .add_table(
            "Items",
            vec![
                FieldDef::new("Id", FieldType::Int).required().indexed(),
                FieldDef::new("Name", FieldType::Str),
            ],
        )
        .unwrap();
    catalog
}

fn linked_catalog() -> Catalog {
    let mut catalog = Catalog::new("primary").unwrap();
    catalog
        .add_table(
            "Resources",
            vec![
                FieldDef::new("Type", FieldType::Int).required().indexed(),
                FieldDef::new("DisplayName", FieldType::Str),
            ],
        )
        .unwrap();
    catalog
        .add_table(
            "Links",
            vec![
                FieldDef::new("Source", FieldType::Ref)
                    .required()
                    .indexed()
                    .references("Resources"),
                FieldDef::new("LinkType", FieldType::Int).indexed(),
            ],
        )
        .unwrap();
    catalog
}

#[test]
fn deleting_half_reports_fifty_percent_wasted() {
    let dir = tempdir().unwrap();
    let mut structure = DbStructure::new(dir.path(), "primary", StoreConfig::default());
    structure.create_database(single_table_catalog()).unwrap();
    let db = structure.open_database().unwrap();
    let table = db.get_table("Items").unwrap();

    let mut handles = Vec::new();
    for id in 0..1000i64 {
        handles.push(
            table
                .insert(&Record::new(vec![Value::Int(id), Value::Null]))
                .unwrap(),
        );
    }
    for (id, handle) in handles.iter().enumerate() {
        if id % 2 == 0 {
            assert!(table.delete(*handle).unwrap());
        }
    }

    let counts = table.wasted_space().unwrap();
    assert_eq!(counts.normal_record_count, 500);
    assert_eq!(counts.total_record_count, 1000);
    // percentage the maintenance view derives
    let wasted =
        (counts.total_record_count - counts.normal_record_count) * 100 / counts.total_record_count;
    assert_eq!(wasted, 50);

    // after compaction no fragmentation remains
    let mut events = 0;
    structure.defragment(|_| events += 1).unwrap();
    assert!(events > 0);

    let db = structure.open_database().unwrap();
    let table = db.get_table("Items").unwrap();
    let counts = table.wasted_space().unwrap();
    assert_eq!(counts.normal_record_count, 500);
    assert_eq!(counts.total_record_count, 500);

    // surviving odd ids remain findable through the rebuilt index
    for id in [1i64, 501, 999] {
        assert_eq!(table.find("Id", &Value::Int(id)).unwrap().len(), 1);
    }
    structure.shutdown().unwrap();
}

#[test]
fn defragment_patches_cross_table_references() {
    let dir = tempdir().unwrap();
    let mut structure = DbStructure::new(dir.path(), "primary", StoreConfig::default());
    structure.create_database(linked_catalog()).unwrap();
    let db = structure.open_database().unwrap();

    // ten resources; tombstone the first five to force relocation
    let mut resource_handles = Vec::new();
    {
        let resources = db.get_table("Resources").unwrap();
        for i in 0..10i64 {
            resource_handles.push(
                resources
                    .insert(&Record::new(vec![
                        Value::Int(1),
                        Value::Str(format!("res-{}", i)),
                    ]))
                    .unwrap(),
            );
        }
        for handle in &resource_handles[..5] {
            resources.delete(*handle).unwrap();
        }
    }

    // links pointing at the surviving resources
    let mut link_handles = Vec::new();
    {
        let links = db.get_table("Links").unwrap();
        for handle in &resource_handles[5..] {
            link_handles.push(
                links
                    .insert(&Record::new(vec![Value::Ref(*handle), Value::Int(3)]))
                    .unwrap(),
            );
        }
    }

    db.defragment(|_, _, _| {}).unwrap();

    // every link's Source must resolve to a live resource with the
    // expected display name, through the patched handle
    let mut targets = Vec::new();
    {
        let links = db.get_table("Links").unwrap();
        let mut scan = links.scan().unwrap();
        while let Some((_, record)) = scan.next(links).unwrap() {
            targets.push(record.get(0).unwrap().as_ref_handle().unwrap());
        }
    }
    assert_eq!(targets.len(), 5);

    let resources = db.get_table("Resources").unwrap();
    let mut names = Vec::new();
    for target in targets {
        let record = resources.get(target).unwrap().expect("patched ref resolves");
        names.push(record.get(1).unwrap().as_str().unwrap().to_string());
    }
    names.sort();
    assert_eq!(names, vec!["res-5", "res-6", "res-7", "res-8", "res-9"]);

    // old handles are dead after compaction
    for handle in &resource_handles[5..] {
        assert!(resources.get(*handle).unwrap().is_none());
    }
    structure.shutdown().unwrap();
}

#[test]
fn defragment_invalidates_outstanding_handles() {
    // defragmentation reassigns handles; holders re-resolve through
    // indexes afterwards
    let dir = tempdir().unwrap();
    let mut structure = DbStructure::new(dir.path(), "primary", StoreConfig::default());
    structure.create_database(single_table_catalog()).unwrap();
    let db = structure.open_database().unwrap();
    let table = db.get_table("Items").unwrap();

    let doomed = table
        .insert(&Record::new(vec![Value::Int(1), Value::Null]))
        .unwrap();
    let survivor = table
        .insert(&Record::new(vec![Value::Int(2), Value::Null]))
        .unwrap();
    table.delete(doomed).unwrap();

    db.defragment(|_, _, _| {}).unwrap();

    let table = db.get_table("Items").unwrap();
    // the survivor moved; its current handle comes from the index
    let found = table.find("Id", &Value::Int(2)).unwrap();
    assert_eq!(found.len(), 1);
    assert_ne!(found[0], survivor);
    assert!(found[0] != RecordHandle::NULL);
    let record = table.get(found[0]).unwrap().unwrap();
    assert_eq!(record.get(0).unwrap().as_int().unwrap(), 2);

    structure.shutdown().unwrap();
}
