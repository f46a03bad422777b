use perobs_core::Config;

#[test_log::test]
fn sweep_defragments_file_to_exactly_the_live_data() -> perobs_core::Result<()> {
    let folder = tempfile::tempdir()?;
    let mut db = Config::new(folder.path()).open()?;

    for id in 1..=20u64 {
        db.put(id, &vec![b'x'; 32])?;
    }

    let reachable: Vec<u64> = (1..=10).collect();
    db.gc(reachable.iter().copied())?;

    for &id in &reachable {
        assert!(db.contains(id)?);
        assert_eq!(db.get(id)?, Some(vec![b'x'; 32]));
    }

    // One header (25 bytes) + 32-byte payload per surviving record, back to back.
    const HEADER_LEN: u64 = 25;
    let expected_size = reachable.len() as u64 * (HEADER_LEN + 32);
    let on_disk = std::fs::metadata(folder.path().join("database.blobs"))?.len();
    assert_eq!(on_disk, expected_size);

    assert_eq!(db.check(false)?, 0);
    Ok(())
}
