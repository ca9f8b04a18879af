//! APK signing

use apkforge_exec::ProcessInfo;

use super::{remove_file_if_exists, BuildContext, BuildStage, StageOutcome};
use crate::error::{BuildError, BuildResult};
use crate::signing::{KeystoreError, KeystoreHelper};

const KS_PASS_ENV: &str = "APKFORGE_KS_PASS";
const KEY_PASS_ENV: &str = "APKFORGE_KEY_PASS";

pub(super) fn run(ctx: &BuildContext<'_>) -> BuildResult<StageOutcome> {
    let project = ctx.project;
    let signing = ctx
        .signing
        .ok_or_else(|| BuildError::MissingInput("signing configuration".to_string()))?;
    let unsigned = project.unsigned_apk();
    if !unsigned.is_file() {
        return Err(BuildError::MissingInput(format!(
            "unsigned APK not found at {}",
            unsigned.display()
        )));
    }

    let keystore = KeystoreHelper::new(&ctx.config.tools.keytool, ctx.runner.clone())
        .map_err(keystore_error)?;
    if signing.debug && !signing.store_file.exists() {
        keystore
            .create_debug_store(
                signing.store_type.as_deref(),
                &signing.store_file,
                &signing.store_password,
                &signing.key_password,
                &signing.key_alias,
                ctx.token,
            )
            .map_err(keystore_error)?;
    }

    let certificate = keystore
        .certificate_info(
            signing.store_type.as_deref(),
            &signing.store_file,
            &signing.store_password,
            &signing.key_alias,
            ctx.token,
        )
        .map_err(keystore_error)?;
    tracing::info!(
        owner = %certificate.owner,
        sha256 = certificate.sha256.as_deref().unwrap_or("-"),
        debug = signing.debug,
        "signing certificate"
    );

    let apksigner = ctx.tool(&ctx.config.tools.apksigner)?;
    let signed = project.signed_apk();
    remove_file_if_exists(&signed)?;

    let mut info = ProcessInfo::new(apksigner)
        .describe("apksigner")
        .args(["sign", "--ks"])
        .arg_path(&signing.store_file)
        .args(["--ks-key-alias", signing.key_alias.as_str()])
        .args(["--ks-pass".to_string(), format!("env:{}", KS_PASS_ENV)])
        .args(["--key-pass".to_string(), format!("env:{}", KEY_PASS_ENV)])
        .env(KS_PASS_ENV, signing.store_password.expose())
        .env(KEY_PASS_ENV, signing.key_password.expose());
    if let Some(store_type) = &signing.store_type {
        info = info.args(["--ks-type", store_type.as_str()]);
    }
    info = info.arg("--out").arg_path(&signed).arg_path(&unsigned);

    ctx.run_tool(BuildStage::SignApk, &info)?;
    if !signed.is_file() {
        return Err(BuildError::Tool {
            stage: BuildStage::SignApk.name(),
            tool: "apksigner".to_string(),
            detail: format!("no signed APK written to {}", signed.display()),
        });
    }
    tracing::info!(apk = %signed.display(), "APK signed");
    Ok(StageOutcome::Ran)
}

fn keystore_error(err: KeystoreError) -> BuildError {
    if err.is_cancelled() {
        BuildError::Cancelled
    } else {
        BuildError::Keystore(err)
    }
}
