#![allow(clippy::unwrap_used)]

use hdb_catalog::{AttributeDef, Catalog, CatalogError, ComputedSource};
use hdb_types::TableRef;
use tempfile::TempDir;

#[test]
fn catalog_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("catalog.json");
    let dog = TableRef::new("dev", "dog");

    {
        let catalog = Catalog::open(&path).unwrap();
        catalog
            .create_table(
                &dog,
                "id",
                vec![
                    AttributeDef::indexed("owner_id"),
                    AttributeDef::computed(
                        "age_in_months",
                        ComputedSource::Formula("age * 12".into()),
                        false,
                    ),
                ],
            )
            .unwrap();
        catalog.ensure_attributes(&dog, ["name"]).unwrap();
        catalog.create_database("empty").unwrap();
    }

    let reopened = Catalog::open(&path).unwrap();
    let table = reopened.table(&dog).unwrap();
    assert!(table.has_attribute("name"));
    assert!(table.is_computed("age_in_months"));
    assert_eq!(table.secondary_indexes(), vec!["owner_id"]);
    assert!(reopened.has_database("empty"));
}

#[test]
fn dropped_structures_stay_dropped() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("catalog.json");
    let dog = TableRef::new("dev", "dog");

    {
        let catalog = Catalog::open(&path).unwrap();
        catalog.create_table(&dog, "id", Vec::new()).unwrap();
        catalog.drop_table(&dog).unwrap();
        catalog.drop_database("dev").unwrap();
    }

    let reopened = Catalog::open(&path).unwrap();
    assert!(matches!(
        reopened.table(&dog),
        Err(CatalogError::DatabaseNotFound(_))
    ));
}

#[test]
fn corrupt_snapshot_is_reported() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("catalog.json");
    std::fs::write(&path, "{not json").unwrap();
    assert!(matches!(Catalog::open(&path), Err(CatalogError::Decode(_))));
}
