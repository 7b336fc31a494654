use anyhow::{Result, bail};

use super::session::Session;
use crate::core::dataset::{DatasetLoader, ImportSummary};
use crate::core::model::{build_model, incompatible_samples};
use crate::core::terminal::{print_status, print_step, print_success};

pub async fn run_import(session: &Session, path: &str, gold: bool) -> Result<()> {
    print_step(&format!("Importing {}...", path));
    let samples = DatasetLoader::new(path).gold(gold).load().await?;
    let model = build_model(&session.config.model)?;
    let mismatched = incompatible_samples(model.as_ref(), &samples);
    if let Some(first) = mismatched.first() {
        bail!(
            "{} samples are not labeled for {}, which the '{}' model expects (first is '{}')",
            mismatched.len(),
            model.annotation_kind().as_str(),
            model.kind(),
            first.id
        );
    }
    session.store.save_samples(&samples).await?;

    let summary = ImportSummary::of(&samples);
    print_success(&format!("Imported {} samples.", summary.total));
    print_status("Labeled", &summary.labeled.to_string());
    print_status("Pending", &summary.pending.to_string());
    print_status("Gold", &summary.gold.to_string());
    Ok(())
}
