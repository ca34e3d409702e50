//! Related-ref expansion: extensions, locale subsets, and their lifecycle
//! flags.

use freight_schema::{AppMetadata, Decomposed, Ref, RefKind};
use freight_store::Summary;
use tracing::debug;

/// An auxiliary ref tied to a primary ref's lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelatedRef {
    pub ref_: Ref,
    /// Subpaths to materialise, for locale-subset extensions.
    pub subpaths: Vec<String>,
    /// Install along with the primary by default.
    pub should_download: bool,
    /// Remove along with the primary.
    pub should_delete: bool,
    /// Prune once nothing matching `autoprune-unless` remains.
    pub should_autoprune: bool,
}

/// Expand the `[Extension *]` declarations of `metadata` against what the
/// remote actually publishes.
///
/// Locale extensions restrict their checkout to the configured `languages`;
/// `subdirectories=true` extensions enumerate every published ref sharing
/// the extension's name prefix.
pub fn related_refs_for(
    metadata: &AppMetadata,
    parent: &Ref,
    summary: &Summary,
    languages: &[String],
) -> Vec<RelatedRef> {
    let mut related = Vec::new();
    for ext in &metadata.extensions {
        let versions: Vec<&str> = if ext.versions.is_empty() {
            vec![parent.branch()]
        } else {
            ext.versions.iter().map(String::as_str).collect()
        };
        let subpaths: Vec<String> = if ext.locale_subset {
            languages.iter().map(|l| format!("/{l}")).collect()
        } else {
            Vec::new()
        };
        // Locale subsets stay cheap, so they download even when the
        // extension opts out of autodownload.
        let should_download = !ext.no_autodownload || ext.locale_subset;

        for version in &versions {
            let mut candidates: Vec<Ref> = Vec::new();
            if ext.subdirectories {
                let prefix = format!("{}.", ext.name);
                for refstr in summary.refs.keys() {
                    let Ok(d) = Decomposed::parse(refstr) else {
                        continue;
                    };
                    if d.kind == RefKind::Runtime
                        && d.arch == parent.arch()
                        && d.branch == *version
                        && d.name.starts_with(&prefix)
                    {
                        if let Ok(r) = Ref::new(RefKind::Runtime, d.name, d.arch, d.branch) {
                            candidates.push(r);
                        }
                    }
                }
            }
            let direct = Ref::new(RefKind::Runtime, &ext.name, parent.arch(), *version);
            if let Ok(r) = direct {
                if summary.refs.contains_key(r.format_cached()) {
                    candidates.push(r);
                }
            }

            for ref_ in candidates {
                debug!("related ref {} for {}", ref_.format_cached(), parent.format_cached());
                related.push(RelatedRef {
                    ref_,
                    subpaths: subpaths.clone(),
                    should_download,
                    should_delete: ext.autodelete,
                    should_autoprune: ext.autoprune_unless.is_some(),
                });
            }
        }
    }
    related.sort_by(|a, b| a.ref_.format_cached().cmp(b.ref_.format_cached()));
    related.dedup_by(|a, b| a.ref_ == b.ref_);
    related
}
