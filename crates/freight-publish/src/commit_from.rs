//! Re-commit a tree from one repository into another with rebound metadata.
//!
//! The rewritten commit keeps the source tree byte-for-byte, replaces the
//! ref/collection bindings, records the source commit, recomputes the
//! download size, and re-homes any matching static deltas. Detached
//! signatures are never copied; the destination commit id differs and any
//! required signatures are issued fresh against it.

use crate::PublishError;
use freight_schema::variant::{
    Variant, OSTREE_COLLECTION_BINDING, OSTREE_COLLECTION_REFS_BINDING, OSTREE_ENDOFLIFE,
    OSTREE_ENDOFLIFE_REBASE, OSTREE_REF_BINDING, XA_DOWNLOAD_SIZE, XA_FROM_COMMIT, XA_REF,
    XA_SUBSETS, XA_TOKEN_TYPE,
};
use freight_store::{
    closure_bytes, copy_tree, delta, CancelToken, Repo, Summary,
};
use tracing::{debug, info};

/// Knobs for one rewrite.
#[derive(Debug, Clone, Default)]
pub struct CommitFromOptions {
    /// Produce a new commit even when the tree is unchanged.
    pub force: bool,
    /// Timestamp override; defaults to the source commit's.
    pub timestamp: Option<i64>,
    /// Replace (`Some`) or clear (`Some(vec![])`) the subset list;
    /// `None` keeps the source's.
    pub subsets: Option<Vec<String>>,
    /// Replace the token type; `None` keeps the source's.
    pub token_type: Option<i32>,
    pub end_of_life: Option<String>,
    pub end_of_life_rebase: Option<String>,
    /// Extra `(collection, ref)` bindings recorded alongside the primary.
    pub extra_collection_refs: Vec<(String, String)>,
    /// Key ids to sign the new commit with.
    pub gpg_keys: Vec<String>,
    pub gpg_homedir: Option<std::path::PathBuf>,
    /// Regenerate the destination summary afterwards.
    pub update_summary: bool,
}

/// What a rewrite produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitFromOutcome {
    pub commit: String,
    /// `false` when the destination tip already carried this tree.
    pub changed: bool,
}

/// Rewrite `src_ref` of `src` into `dst_ref` of `dst`.
pub fn commit_from(
    src: &Repo,
    src_ref: &str,
    dst: &Repo,
    dst_ref: &str,
    options: &CommitFromOptions,
) -> Result<CommitFromOutcome, PublishError> {
    let src_commit = src
        .resolve_rev(src_ref, false)?
        .ok_or_else(|| freight_store::StoreError::RefNotFound(src_ref.to_owned()))?;
    let src_info = src.load_commit(&src_commit)?;
    if src_info.partial {
        return Err(PublishError::PartialCommit(src_commit));
    }

    let dst_parent = dst.resolve_rev(dst_ref, true)?;
    if let Some(ref parent_id) = dst_parent {
        let parent = dst.load_commit(parent_id)?;
        if parent.record.root_tree == src_info.record.root_tree
            && !options.force
            && options.end_of_life_rebase.is_none()
        {
            info!("no change for {dst_ref}; tip stays at {}", &parent_id[..8]);
            return Ok(CommitFromOutcome {
                commit: parent_id.clone(),
                changed: false,
            });
        }
    }

    copy_tree(src.objects(), dst.objects(), &src_info.record.root_tree)?;

    let mut metadata = src_info.record.metadata.clone();
    metadata.insert(XA_REF.to_owned(), Variant::str(dst_ref));
    metadata.insert(XA_FROM_COMMIT.to_owned(), Variant::str(&src_commit));
    metadata.insert(
        OSTREE_REF_BINDING.to_owned(),
        Variant::StrList(vec![dst_ref.to_owned()]),
    );
    metadata.insert(
        OSTREE_COLLECTION_BINDING.to_owned(),
        Variant::str(dst.collection_id().unwrap_or_default()),
    );
    if options.extra_collection_refs.is_empty() {
        metadata.remove(OSTREE_COLLECTION_REFS_BINDING);
    } else {
        metadata.insert(
            OSTREE_COLLECTION_REFS_BINDING.to_owned(),
            Variant::StrList(
                options
                    .extra_collection_refs
                    .iter()
                    .map(|(collection, r)| format!("{collection}/{r}"))
                    .collect(),
            ),
        );
    }
    metadata.insert(
        XA_DOWNLOAD_SIZE.to_owned(),
        Variant::U64(closure_bytes(dst.objects(), &src_info.record.root_tree)?),
    );
    match &options.subsets {
        None => {}
        Some(subsets) if subsets.is_empty() => {
            metadata.remove(XA_SUBSETS);
        }
        Some(subsets) => {
            metadata.insert(XA_SUBSETS.to_owned(), Variant::StrList(subsets.clone()));
        }
    }
    if let Some(token_type) = options.token_type {
        metadata.insert(XA_TOKEN_TYPE.to_owned(), Variant::I32(token_type));
    }
    if let Some(ref eol) = options.end_of_life {
        metadata.insert(OSTREE_ENDOFLIFE.to_owned(), Variant::str(eol));
    }
    if let Some(ref rebase) = options.end_of_life_rebase {
        metadata.insert(OSTREE_ENDOFLIFE_REBASE.to_owned(), Variant::str(rebase));
    }

    let new_commit = dst.write_commit(
        dst_parent.as_deref(),
        &src_info.record.subject,
        &src_info.record.body,
        metadata.clone(),
        &src_info.record.root_tree,
        Some(options.timestamp.unwrap_or(src_info.record.timestamp)),
    )?;

    for key in &options.gpg_keys {
        dst.sign_commit(&new_commit, key, options.gpg_homedir.as_deref())?;
    }

    let mut tx = dst.transaction()?;
    tx.set_ref(dst.collection_id(), dst_ref, Some(&new_commit));
    tx.commit()?;

    rehome_matching_deltas(src, &src_commit, dst, &new_commit, dst_parent.as_deref(), &metadata)?;

    if options.update_summary {
        Summary::regenerate(dst, &CancelToken::new())?;
    }
    info!("rewrote {src_ref}@{} into {dst_ref}@{}", &src_commit[..8], &new_commit[..8]);
    Ok(CommitFromOutcome {
        commit: new_commit,
        changed: true,
    })
}

/// For every `from ∈ {none, dst_parent}` with a source delta targeting the
/// source commit, copy the parts verbatim and splice the new commit record
/// and detached metadata into the rewritten superblock.
fn rehome_matching_deltas(
    src: &Repo,
    src_commit: &str,
    dst: &Repo,
    new_commit: &str,
    dst_parent: Option<&str>,
    new_metadata: &freight_schema::CommitMetadata,
) -> Result<(), PublishError> {
    let new_record = dst.load_commit(new_commit)?.record;
    let candidates: Vec<Option<&str>> = match dst_parent {
        Some(parent) => vec![None, Some(parent)],
        None => vec![None],
    };
    for from in candidates {
        let src_name = delta::delta_name(from, src_commit);
        let superblock_path = src
            .layout()
            .deltas_dir()
            .join(&src_name)
            .join("superblock");
        if !superblock_path.is_file() {
            continue;
        }
        let mut superblock = delta::read_delta_superblock(&superblock_path)?;
        superblock.to = new_commit.to_owned();
        superblock.from = from.map(str::to_owned);
        superblock.commit = new_record.clone();
        superblock.detached_metadata = new_metadata.clone();
        delta::rehome_delta(src, &src_name, dst, &superblock)?;
        debug!("re-homed delta {src_name} for {}", &new_commit[..8]);
    }
    Ok(())
}
