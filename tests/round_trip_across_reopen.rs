use perobs_core::Config;

#[test_log::test]
fn round_trip_across_reopen() -> perobs_core::Result<()> {
    let folder = tempfile::tempdir()?;
    let path = folder.path();

    {
        let mut db = Config::new(path).open()?;
        db.put(1, b"hello")?;
        db.put(2, b"world")?;
        db.close()?;
    }

    let mut db = Config::new(path).open()?;
    assert_eq!(db.get(1)?, Some(b"hello".to_vec()));
    assert_eq!(db.get(2)?, Some(b"world".to_vec()));
    Ok(())
}
