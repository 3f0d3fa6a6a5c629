use tdb::{
    ColumnType, Database, Decimal128, ObjectId, Timestamp, Uuid, Value,
};
use test_log::test;

#[test]
fn every_column_type_roundtrips_across_reopen() -> tdb::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("db.tdb");

    let values = [
        ("int", ColumnType::Int, Value::Int(-987_654_321)),
        ("bool", ColumnType::Bool, Value::Bool(true)),
        ("float", ColumnType::Float, Value::Float(3.5)),
        ("double", ColumnType::Double, Value::Double(-2.25)),
        ("string", ColumnType::String, Value::String("héllo".into())),
        ("binary", ColumnType::Binary, Value::Binary(vec![0, 255, 7])),
        (
            "ts",
            ColumnType::Timestamp,
            Value::Timestamp(Timestamp::new(1_700_000_000, 42)),
        ),
        (
            "dec",
            ColumnType::Decimal,
            Value::Decimal(Decimal128([1; 16])),
        ),
        (
            "oid",
            ColumnType::ObjectId,
            Value::ObjectId(ObjectId(*b"012345678901")),
        ),
        ("uuid", ColumnType::Uuid, Value::Uuid(Uuid([9; 16]))),
        ("mixed", ColumnType::Mixed, Value::String("anything".into())),
    ];

    let key = {
        let db = Database::open(&path)?;
        let txn = db.begin_write()?;
        let table = txn.add_table("t")?;

        let mut cols = Vec::new();
        for (name, col_type, _) in &values {
            cols.push(table.add_column(name, *col_type, true)?);
        }

        let obj = table.create_object()?;
        for (col, (_, _, value)) in cols.iter().zip(&values) {
            obj.set(*col, value.clone())?;
        }

        let nulls = table.create_object()?;
        for col in &cols {
            nulls.set(*col, Value::Null)?;
        }

        let key = obj.key();
        txn.commit()?;
        key
    };

    let db = Database::open(&path)?;
    let read = db.begin_read()?;
    let table = read.table("t")?;

    let obj = table.object(key)?;
    for (name, _, expected) in &values {
        assert_eq!(*expected, obj.get(table.col_key(name)?)?, "column {name}");
    }

    // the all-null row stayed null
    table.for_each(|row| {
        if row.key() != key {
            for (name, _, _) in &values {
                assert_eq!(Value::Null, row.get(table.col_key(name)?)?, "column {name}");
            }
        }
        Ok(true)
    })?;

    read.verify()?;
    Ok(())
}

#[test]
fn overwrites_hold_until_the_next_set() -> tdb::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = Database::open(dir.path().join("db.tdb"))?;

    let txn = db.begin_write()?;
    let table = txn.add_table("t")?;
    let n = table.add_column("n", ColumnType::Int, false)?;

    let obj = table.create_object()?;
    obj.set(n, 1)?;
    assert_eq!(Value::Int(1), obj.get(n)?);

    obj.set(n, 2)?;
    assert_eq!(Value::Int(2), obj.get(n)?);

    // widening overwrite
    obj.set(n, i64::MAX)?;
    assert_eq!(Value::Int(i64::MAX), obj.get(n)?);

    txn.commit()?;
    Ok(())
}
