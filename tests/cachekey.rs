use std::path::Path;

use imgproxy::cachekey::CacheKey;

#[test]
fn test_cachekey_is_deterministic() {
    let a = CacheKey::new("https://example.com/a.png");
    let b = CacheKey::new("https://example.com/a.png");
    assert_eq!(a, b);
    assert_eq!(a.relative_path(), b.relative_path());
    assert_eq!(a.url(), "https://example.com/a.png");
}

#[test]
fn test_cachekey_distinct_urls() {
    let a = CacheKey::new("https://example.com/a.png");
    let b = CacheKey::new("https://example.com/b.png");
    assert_ne!(a.hash_hex(), b.hash_hex());
    assert_ne!(a.relative_path(), b.relative_path());
}

#[test]
fn test_cachekey_sharded_layout() {
    // sha1("abc") = a9993e364706816aba3e25717850c26c9cd0d89d
    let key = CacheKey::new("abc");
    assert_eq!(key.hash_hex(), "a9993e364706816aba3e25717850c26c9cd0d89d");
    assert_eq!(
        key.path(Path::new("/var/cache/img")),
        Path::new("/var/cache/img/a9/99/3e/364706816aba3e25717850c26c9cd0d89d")
    );

    let parts: Vec<_> = key.relative_path().iter().map(|p| p.len()).collect();
    assert_eq!(parts, vec![2, 2, 2, 34]);
}

#[test]
fn test_cachekey_display() {
    let key = CacheKey::new("abc");
    assert_eq!(
        key.to_string(),
        "{a9993e364706816aba3e25717850c26c9cd0d89d:abc}"
    );
}
