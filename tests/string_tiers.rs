use tdb::{ColumnType, Database, Value};
use test_log::test;

#[test]
fn string_tiers_survive_commit_and_reopen() -> tdb::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("db.tdb");

    let short = "tiny".to_owned();
    let medium = "m".repeat(40);
    let big = "b".repeat(50_000);

    {
        let db = Database::open(&path)?;
        let txn = db.begin_write()?;
        let table = txn.add_table("t")?;
        let s = table.add_column("s", ColumnType::String, true)?;

        for v in [&short, &medium, &big] {
            table.create_object()?.set(s, v.as_str())?;
        }
        table.create_object()?.set(s, Value::Null)?;

        txn.commit()?;
    }

    let db = Database::open(&path)?;
    let read = db.begin_read()?;
    let table = read.table("t")?;
    let s = table.col_key("s")?;

    let mut seen = Vec::new();
    table.for_each(|obj| {
        seen.push(obj.get(s)?);
        Ok(true)
    })?;

    assert_eq!(
        vec![
            Value::String(short),
            Value::String(medium),
            Value::String(big),
            Value::Null,
        ],
        seen,
    );

    read.verify()?;
    Ok(())
}

#[test]
fn growing_one_string_upgrades_the_whole_leaf() -> tdb::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = Database::open(dir.path().join("db.tdb"))?;

    let txn = db.begin_write()?;
    let table = txn.add_table("t")?;
    let s = table.add_column("s", ColumnType::String, false)?;

    let mut keys = Vec::new();
    for i in 0..100 {
        let obj = table.create_object()?;
        obj.set(s, format!("v{i}"))?;
        keys.push(obj.key());
    }

    // push one value through every tier; neighbors must stay intact
    let probe = keys[50];
    for len in [10usize, 40, 500, 100_000] {
        table.object(probe)?.set(s, "x".repeat(len))?;

        assert_eq!(Value::String("v0".into()), table.object(keys[0])?.get(s)?);
        assert_eq!(Value::String("v99".into()), table.object(keys[99])?.get(s)?);
        assert_eq!(
            Value::String("x".repeat(len)),
            table.object(probe)?.get(s)?,
        );
    }

    txn.commit()?;
    Ok(())
}
