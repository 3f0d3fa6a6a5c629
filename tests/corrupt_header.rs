use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use tdb::{ColumnType, Database, Error};
use test_log::test;

fn patch_byte(path: &std::path::Path, offset: u64, value: u8) -> std::io::Result<()> {
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(&[value])?;
    file.sync_all()
}

fn file_bytes(path: &std::path::Path) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    std::fs::File::open(path)?.read_to_end(&mut buf)?;
    Ok(buf)
}

fn make_db(path: &std::path::Path) -> tdb::Result<()> {
    let db = Database::open(path)?;
    let txn = db.begin_write()?;
    let table = txn.add_table("t")?;
    let n = table.add_column("n", ColumnType::Int, false)?;
    table.create_object()?.set(n, 1)?;
    txn.commit()?;
    Ok(())
}

#[test]
fn corrupt_selector_fails_without_mutation() -> tdb::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("db.tdb");
    make_db(&path)?;

    // selector byte out of band
    patch_byte(&path, 16, 0xFF)?;
    let before = file_bytes(&path)?;

    assert!(matches!(
        Database::open(&path),
        Err(Error::InvalidDatabase(_))
    ));

    // the failed open did not touch the file
    assert_eq!(before, file_bytes(&path)?);
    Ok(())
}

#[test]
fn corrupt_magic_is_invalid_database() -> tdb::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("db.tdb");
    make_db(&path)?;

    patch_byte(&path, 19, b'X')?;

    assert!(matches!(
        Database::open(&path),
        Err(Error::InvalidDatabase(_))
    ));
    Ok(())
}

#[test]
fn unknown_format_version_is_unsupported() -> tdb::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("db.tdb");
    make_db(&path)?;

    patch_byte(&path, 17, 99)?;

    assert!(matches!(
        Database::open(&path),
        Err(Error::UnsupportedFileFormat(99))
    ));
    Ok(())
}

#[test]
fn truncated_file_is_invalid_database() -> tdb::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("db.tdb");

    std::fs::write(&path, b"T-DB")?;

    assert!(matches!(
        Database::open(&path),
        Err(Error::InvalidDatabase(_))
    ));
    Ok(())
}
