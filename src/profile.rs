//! Startup profile loader: unpacks `./profiles/*.zip` into the profiles
//! directory and maps each archive's top-level directory name to a tag
//! usable on the `/connect?profile=` query string.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

use crate::error::ProfileError;

pub const PROFILES_DIR: &str = "./profiles";
const ZIP_EXT: &str = "zip";

/// Tag -> unpacked top-level directory name, relative to [`PROFILES_DIR`].
pub struct ProfileRegistry {
    tag_to_profile: HashMap<String, String>,
}

impl ProfileRegistry {
    pub fn get(&self, tag: &str) -> Option<&str> {
        self.tag_to_profile.get(tag).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tag_to_profile.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tag_to_profile.is_empty()
    }
}

/// Scan [`PROFILES_DIR`] for `*.zip` archives and extract each one. A no-op,
/// returning an empty registry, when custom profiles are disabled.
pub fn load_profiles(enabled: bool) -> Result<ProfileRegistry, ProfileError> {
    if !enabled {
        return Ok(ProfileRegistry {
            tag_to_profile: HashMap::new(),
        });
    }

    let dir = Path::new(PROFILES_DIR);
    if !dir.exists() {
        std::fs::create_dir_all(dir)?;
        tracing::info!("profiles directory initialized, no profiles to unzip");
        return Ok(ProfileRegistry {
            tag_to_profile: HashMap::new(),
        });
    }

    let mut tag_to_profile = HashMap::new();
    tracing::info!("attempting to unzip profiles");

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(ZIP_EXT) {
            continue;
        }

        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();

        match unzip_source(&path, dir) {
            Ok(profile) => {
                tracing::info!(profile = %profile, "loaded profile");
                tag_to_profile.insert(stem, profile);
            }
            Err(e) => {
                tracing::error!(error = %e, profile = %stem, "unable to load profile");
            }
        }
    }

    tracing::info!(count = tag_to_profile.len(), "unzipped profile(s)");
    Ok(ProfileRegistry { tag_to_profile })
}

/// Extract `source` into `destination`, rejecting any entry that would
/// escape it (zip-slip), and return the archive's first entry name with any
/// trailing slash stripped as the profile's tag.
fn unzip_source(source: &Path, destination: &Path) -> Result<String, ProfileError> {
    let file = std::fs::File::open(source)?;
    let mut archive = zip::ZipArchive::new(file)?;

    let destination = destination.canonicalize()?;
    let mut profile = None;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        if profile.is_none() {
            profile = Some(entry.name().trim_end_matches('/').to_string());
        }

        let enclosed = entry
            .enclosed_name()
            .ok_or_else(|| ProfileError::ZipSlip(entry.name().to_string()))?
            .to_path_buf();
        let out_path = destination.join(&enclosed);

        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut out_file = std::fs::File::create(&out_path)?;
        let mut buf = Vec::new();
        entry.read_to_end(&mut buf)?;
        std::io::Write::write_all(&mut out_file, &buf)?;
    }

    profile.ok_or_else(|| ProfileError::ZipSlip("empty archive".to_string()))
}
