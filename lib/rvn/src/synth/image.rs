// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Where a host's base image lives in the local image cache.
//!
//! Fetching images into the cache is a separate step; this only maps an image
//! reference to the cache path a copy-on-write instance image backs onto.

use std::path::{Path, PathBuf};

use http::Uri;
use thiserror::Error;

use crate::topology::NETBOOT;

/// Classification of an image reference as written in a topology.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ImageRef {
    /// No disk of its own; the placeholder netboot image.
    Netboot,
    /// A name from the image mirror, e.g. `debian-bullseye`.
    Named(String),
    /// A path on the hypervisor host.
    Local(PathBuf),
    /// A URL with a host component.
    Remote { user: Option<String>, authority: String, path: Vec<String> },
}

#[derive(Debug, Error)]
#[error("image reference {image:?} has unusable path segment {segment:?}")]
pub struct ImageError {
    pub image: String,
    pub segment: String,
}

/// A segment that stays inside the directory it is joined onto.
fn checked_segment(image: &str, segment: &str) -> Result<String, ImageError> {
    if segment.is_empty() || segment == "." || segment == ".." {
        return Err(ImageError {
            image: image.to_string(),
            segment: segment.to_string(),
        });
    }
    Ok(segment.to_string())
}

impl ImageRef {
    pub fn parse(image: &str) -> Result<Self, ImageError> {
        if image.is_empty() || image == NETBOOT {
            return Ok(ImageRef::Netboot);
        }
        if !image.contains('/') {
            return Ok(ImageRef::Named(checked_segment(image, image)?));
        }
        match image.parse::<Uri>() {
            Ok(uri) if uri.authority().is_some() => {
                let authority = uri.authority().map(|a| a.as_str()).unwrap_or("");
                let (user, host) = match authority.rsplit_once('@') {
                    Some((userinfo, host)) => {
                        let user = userinfo.split(':').next().unwrap_or("");
                        (Some(user).filter(|u| !u.is_empty()), host)
                    }
                    None => (None, authority),
                };
                let user =
                    user.map(|u| checked_segment(image, u)).transpose()?;
                let path = uri
                    .path()
                    .strip_prefix('/')
                    .unwrap_or(uri.path())
                    .split('/')
                    .map(|s| checked_segment(image, s))
                    .collect::<Result<_, _>>()?;
                Ok(ImageRef::Remote {
                    user,
                    authority: checked_segment(image, host)?,
                    path,
                })
            }
            _ => {
                let path = PathBuf::from(image);
                if path.file_name().is_none() {
                    return Err(ImageError {
                        image: image.to_string(),
                        segment: image.to_string(),
                    });
                }
                Ok(ImageRef::Local(path))
            }
        }
    }

    /// Cache location of the base image under `image_dir`.
    pub fn base_path(&self, image_dir: &Path) -> PathBuf {
        match self {
            ImageRef::Netboot => image_dir.join(NETBOOT),
            ImageRef::Named(name) => image_dir.join(name),
            ImageRef::Local(path) => {
                let mut p = image_dir.join("user");
                if let Some(file) = path.file_name() {
                    p.push(file);
                }
                p
            }
            ImageRef::Remote { user, authority, path } => {
                let mut p = image_dir.join("user");
                if let Some(user) = user {
                    p.push(user);
                }
                p.push(authority);
                p.extend(path);
                p
            }
        }
    }
}

pub fn base_image_path(
    image_dir: &Path,
    image: &str,
) -> Result<PathBuf, ImageError> {
    Ok(ImageRef::parse(image)?.base_path(image_dir))
}

#[cfg(test)]
mod test {
    use super::*;

    const DIR: &str = "/var/rvn/img";

    fn path(image: &str) -> PathBuf {
        base_image_path(Path::new(DIR), image).unwrap()
    }

    #[test]
    fn cache_layout() {
        assert_eq!(path(""), PathBuf::from("/var/rvn/img/netboot"));
        assert_eq!(path("netboot"), PathBuf::from("/var/rvn/img/netboot"));
        assert_eq!(
            path("debian-bullseye"),
            PathBuf::from("/var/rvn/img/debian-bullseye")
        );
        assert_eq!(
            path("./images/custom.qcow2"),
            PathBuf::from("/var/rvn/img/user/custom.qcow2")
        );
        assert_eq!(
            path("/home/lab/fedora"),
            PathBuf::from("/var/rvn/img/user/fedora")
        );
        assert_eq!(
            path("https://mirror.example.com/rvn/img/alpine"),
            PathBuf::from("/var/rvn/img/user/mirror.example.com/rvn/img/alpine")
        );
        assert_eq!(
            path("https://deploy@files.example.com:8443/x/y/img"),
            PathBuf::from("/var/rvn/img/user/deploy/files.example.com:8443/x/y/img")
        );
    }

    #[test]
    fn classification() {
        assert_eq!(ImageRef::parse("").unwrap(), ImageRef::Netboot);
        assert!(matches!(
            ImageRef::parse("cumulus-latest"),
            Ok(ImageRef::Named(_))
        ));
        assert!(matches!(ImageRef::parse("/abs/img"), Ok(ImageRef::Local(_))));
        assert!(matches!(
            ImageRef::parse("https://h/p/img"),
            Ok(ImageRef::Remote { ref authority, .. }) if authority == "h"
        ));
    }

    #[test]
    fn paths_stay_inside_the_cache() {
        for image in [
            "..",
            "https://h/../../etc/shadow",
            "https://h/a//img",
            "https://h/a/./img",
            "https://h/",
            "https://..@h/img",
            "/var/tmp/..",
        ] {
            let err = base_image_path(Path::new(DIR), image).unwrap_err();
            assert_eq!(err.image, image);
        }
    }
}
