//! Delta-layer discovery by annotation.

use crate::spec::{Descriptor, Index, Manifest};
use crate::{DELTA_ANNOTATION_FROM, DELTA_ANNOTATION_TARGET, DELTA_ANNOTATION_TO};

/// Find the layer of a delta manifest carrying the diff between two rootfs
/// diff-ids. A from-scratch delta has no `from` annotation.
pub fn find_delta_layer<'a>(
    manifest: &'a Manifest,
    from_diffid: Option<&str>,
    to_diffid: &str,
) -> Option<&'a Descriptor> {
    manifest.layers.iter().find(|layer| {
        layer.annotations.get(DELTA_ANNOTATION_TO).map(String::as_str) == Some(to_diffid)
            && layer.annotations.get(DELTA_ANNOTATION_FROM).map(String::as_str) == from_diffid
    })
}

/// Find the delta manifest targeting an image digest inside a delta index.
pub fn find_delta_manifest<'a>(index: &'a Index, target_digest: &str) -> Option<&'a Descriptor> {
    index.manifests.iter().find(|desc| {
        desc.annotations.get(DELTA_ANNOTATION_TARGET).map(String::as_str) == Some(target_digest)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::Descriptor;

    fn delta_layer(from: Option<&str>, to: &str) -> Descriptor {
        let mut d = Descriptor {
            media_type: crate::MEDIA_TYPE_LAYER.to_owned(),
            digest: format!("sha256:{to}-data"),
            size: 1,
            ..Descriptor::default()
        };
        if let Some(f) = from {
            d.annotations
                .insert(DELTA_ANNOTATION_FROM.to_owned(), f.to_owned());
        }
        d.annotations
            .insert(DELTA_ANNOTATION_TO.to_owned(), to.to_owned());
        d
    }

    #[test]
    fn finds_matching_layer() {
        let mut manifest = Manifest::new(Descriptor::default());
        manifest.layers.push(delta_layer(Some("sha256:a"), "sha256:b"));
        manifest.layers.push(delta_layer(None, "sha256:b"));

        let incremental = find_delta_layer(&manifest, Some("sha256:a"), "sha256:b").unwrap();
        assert!(incremental.annotations.contains_key(DELTA_ANNOTATION_FROM));
        let scratch = find_delta_layer(&manifest, None, "sha256:b").unwrap();
        assert!(!scratch.annotations.contains_key(DELTA_ANNOTATION_FROM));
    }

    #[test]
    fn no_match_returns_none() {
        let mut manifest = Manifest::new(Descriptor::default());
        manifest.layers.push(delta_layer(Some("sha256:a"), "sha256:b"));
        assert!(find_delta_layer(&manifest, Some("sha256:x"), "sha256:b").is_none());
        assert!(find_delta_layer(&manifest, Some("sha256:a"), "sha256:y").is_none());
    }

    #[test]
    fn finds_delta_manifest_by_target() {
        let mut index = Index::new();
        let mut desc = Descriptor {
            media_type: crate::MEDIA_TYPE_MANIFEST.to_owned(),
            digest: "sha256:deltamanifest".to_owned(),
            size: 2,
            ..Descriptor::default()
        };
        desc.annotations
            .insert(DELTA_ANNOTATION_TARGET.to_owned(), "sha256:image".to_owned());
        index.manifests.push(desc);

        assert!(find_delta_manifest(&index, "sha256:image").is_some());
        assert!(find_delta_manifest(&index, "sha256:other").is_none());
    }
}
