//! Installation discovery against the host.
//!
//! Tests that need an installation skip themselves when none is found.

use tempdb::{find_installation, iter_installations, Discovery, Platform, TempDbError, Version};

fn host_has_installation() -> bool {
    match find_installation(None) {
        Ok(found) => found.is_some(),
        Err(TempDbError::NoInstallation) => {
            eprintln!("No PostgreSQL installation on this host, skipping");
            false
        }
        Err(e) => panic!("discovery failed: {e}"),
    }
}

#[test]
fn test_host_platform_is_searchable() {
    let discovery = Discovery::host();
    match discovery.platform() {
        Platform::Linux | Platform::Darwin => {
            assert!(!discovery.search_patterns().unwrap().is_empty());
        }
        Platform::Other(_) => {
            assert!(matches!(
                discovery.search_patterns(),
                Err(TempDbError::UnsupportedPlatform(_))
            ));
        }
    }
}

#[test]
fn test_installations_are_complete_and_unique() {
    if !host_has_installation() {
        return;
    }

    let installations: Vec<_> = iter_installations().unwrap().collect();
    assert!(!installations.is_empty());

    let mut seen = std::collections::HashSet::new();
    for installation in &installations {
        assert!(installation.initdb().is_file(), "{:?}", installation);
        assert!(installation.postgres().is_file(), "{:?}", installation);
        assert!(seen.insert(installation.bin_dir.clone()), "duplicate {:?}", installation);
    }
}

#[test]
fn test_default_choice_is_highest_version() {
    if !host_has_installation() {
        return;
    }

    let highest = iter_installations()
        .unwrap()
        .map(|i| i.version)
        .max()
        .unwrap();
    let chosen = find_installation(None).unwrap().unwrap();
    let chosen_version = iter_installations()
        .unwrap()
        .find(|i| i.bin_dir == chosen)
        .map(|i| i.version)
        .unwrap();
    assert_eq!(chosen_version, highest);
}

#[test]
fn test_unmatched_hint_is_none() {
    if !host_has_installation() {
        return;
    }
    assert_eq!(find_installation(Some(&Version::from(1))).unwrap(), None);
}

#[test]
fn test_major_hint_finds_installed_major() {
    if !host_has_installation() {
        return;
    }
    let installed = iter_installations().unwrap().next().unwrap();
    let hint = Version::from(installed.version.major());
    let chosen = find_installation(Some(&hint)).unwrap();
    assert!(chosen.is_some());
}
