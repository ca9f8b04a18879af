//! Fake Android toolchain for pipeline tests
//!
//! Each tool is a small shell script that produces deterministic output and
//! appends a line to `<tools>/<name>.calls` per invocation:
//! - `javac` writes `class <Name>` into `<Name>.class` for every source in the
//!   `@argfile`, and fails on sources containing `COMPILE_ERROR`
//! - `dx` concatenates class files (or copies a jar) into `--output=`
//! - `dex-merger` concatenates its inputs and reports duplicate classes the
//!   way dx does
//! - `aapt package` writes `R.java` in the manifest's package and, unless
//!   `--non-constant-id` is given, a `resources.ap_` listing its `-S`/`-A`
//!   dirs; `aapt add` appends the dex to the APK
//! - `apksigner` checks the store password from the environment and writes
//!   the signed APK
//! - `keytool` stores the password as the keystore content and prints
//!   `-list -v` output

#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use apkforge::config::{BuildConfig, ProjectSettings};
use apkforge::{AndroidBuilder, AndroidProject, SigningConfig};
use apkforge_exec::WorkerPool;
use tempfile::TempDir;

pub const PROJECT_NAME: &str = "hello";

const JAVAC: &str = r#"out=""
argfile=""
while [ $# -gt 0 ]; do
  case "$1" in
    -d) out="$2"; shift ;;
    @*) argfile="${1#@}" ;;
  esac
  shift
done
while IFS= read -r line; do
  src=$(printf '%s' "$line" | tr -d '"')
  if grep -q COMPILE_ERROR "$src"; then
    echo "$src:3: error: ';' expected" >&2
    exit 1
  fi
  name=$(basename "$src" .java)
  echo "class $name" > "$out/$name.class"
done < "$argfile"
"#;

const DX: &str = r#"out=""
src=""
for a in "$@"; do
  case "$a" in
    --output=*) out="${a#--output=}" ;;
    --dex) ;;
    *) src="$a" ;;
  esac
done
if [ -d "$src" ]; then
  find "$src" -name '*.class' | sort | xargs cat > "$out"
else
  cat "$src" > "$out"
fi
"#;

const DEX_MERGER: &str = r#"out="$1"
shift
dups=$(cat "$@" | sort | uniq -d | sed 's/^class //')
if [ -n "$dups" ]; then
  echo "UNEXPECTED TOP-LEVEL EXCEPTION:" >&2
  for c in $dups; do
    echo "com.android.dex.DexException: Multiple dex files define L$c;" >&2
  done
  exit 2
fi
cat "$@" > "$out"
"#;

const AAPT: &str = r#"echo "$@" >> "$TOOLS/aapt.args"
cmd="$1"
shift
case "$cmd" in
  package)
    gen=""
    pkg=""
    manifest=""
    lib=""
    res=""
    assets=""
    while [ $# -gt 0 ]; do
      case "$1" in
        -J) gen="$2"; shift ;;
        -F) pkg="$2"; shift ;;
        -M) manifest="$2"; shift ;;
        -S) res="$res $2"; shift ;;
        -A) assets="$assets $2"; shift ;;
        -I) shift ;;
        --non-constant-id) lib=1 ;;
      esac
      shift
    done
    package=$(sed -n 's/.*package="\([^"]*\)".*/\1/p' "$manifest")
    dir="$gen/$(echo "$package" | tr . /)"
    mkdir -p "$dir"
    echo "package $package; public final class R {}" > "$dir/R.java"
    if [ -z "$lib" ]; then
      {
        echo "resources"
        for d in $res; do echo "res $d"; done
        for d in $assets; do echo "assets $d"; done
      } > "$pkg"
    fi
    ;;
  add)
    [ "$1" = "-k" ] && shift
    apk="$1"
    shift
    for f in "$@"; do
      echo "entry $(basename "$f")" >> "$apk"
      cat "$f" >> "$apk"
    done
    ;;
  *)
    echo "aapt: unknown command $cmd" >&2
    exit 1
    ;;
esac
"#;

const APKSIGNER: &str = r#"echo "$@" >> "$TOOLS/apksigner.args"
ks=""
alias=""
out=""
while [ $# -gt 1 ]; do
  case "$1" in
    --ks) ks="$2"; shift ;;
    --ks-key-alias) alias="$2"; shift ;;
    --out) out="$2"; shift ;;
  esac
  shift
done
unsigned="$1"
if [ "$APKFORGE_KS_PASS" != "$(cat "$ks")" ]; then
  echo "Failed to load signer: keystore password was incorrect" >&2
  exit 1
fi
{ echo "signed-by $alias"; cat "$unsigned"; } > "$out"
"#;

const KEYTOOL: &str = r#"cmd="$1"
shift
store=""
alias=""
while [ $# -gt 0 ]; do
  case "$1" in
    -keystore) store="$2"; shift ;;
    -alias) alias="$2"; shift ;;
  esac
  shift
done
case "$cmd" in
  -genkeypair)
    printf '%s' "$APKFORGE_STORE_PASS" > "$store"
    ;;
  -list)
    if [ ! -f "$store" ]; then
      echo "keytool error: java.lang.Exception: Keystore file does not exist: $store"
      exit 1
    fi
    if [ "$APKFORGE_STORE_PASS" != "$(cat "$store")" ]; then
      echo "keytool error: java.io.IOException: Keystore was tampered with, or password was incorrect"
      exit 1
    fi
    echo "Alias name: $alias"
    echo "Owner: C=US, O=Android, CN=Android Debug"
    echo "Issuer: C=US, O=Android, CN=Android Debug"
    echo "Valid from: Mon Jan 01 00:00:00 UTC 2024 until: Wed Dec 25 00:00:00 UTC 2053"
    echo "Certificate fingerprints:"
    echo "	 SHA256: AB:CD:EF:01:23:45:67:89:AB:CD:EF:01:23:45:67:89:AB:CD:EF:01:23:45:67:89:AB:CD:EF:01:23:45:67:89"
    ;;
esac
"#;

/// A project directory plus a fake toolchain, both in one temp dir.
pub struct FakeProject {
    pub temp: TempDir,
    pub root: PathBuf,
    pub tools: PathBuf,
}

impl FakeProject {
    /// A project with a manifest, one string resource and `Main.java`.
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join(PROJECT_NAME);
        let tools = temp.path().join("tools");
        fs::create_dir_all(&tools).unwrap();

        let fake = Self { temp, root, tools };
        fake.write(
            "src/main/AndroidManifest.xml",
            r#"<manifest package="com.example"><application/></manifest>"#,
        );
        fake.write(
            "src/main/res/values/strings.xml",
            r#"<resources><string name="app_name">Hello</string></resources>"#,
        );
        fake.write(
            "src/main/java/com/example/Main.java",
            "package com.example;\npublic class Main {}\n",
        );

        for (name, script) in [
            ("javac", JAVAC),
            ("dx", DX),
            ("dex-merger", DEX_MERGER),
            ("aapt", AAPT),
            ("apksigner", APKSIGNER),
            ("keytool", KEYTOOL),
        ] {
            fake.install_tool(name, script);
        }
        fs::write(fake.tools.join("android.jar"), b"platform classes").unwrap();
        fake
    }

    fn install_tool(&self, name: &str, body: &str) {
        let path = self.tools.join(name);
        let script = format!(
            "#!/bin/sh\nTOOLS=\"{}\"\necho run >> \"$TOOLS/{}.calls\"\n{}",
            self.tools.display(),
            name,
            body
        );
        fs::write(&path, script).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    /// Write a file relative to the project root.
    pub fn write(&self, relative: &str, content: &str) -> PathBuf {
        let path = self.root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        path
    }

    pub fn add_jar(&self, name: &str, content: &str) -> PathBuf {
        self.write(&format!("libs/{}", name), content)
    }

    /// An Android library under `libraries/<name>` with one string resource
    /// and one asset. Returns its directory relative to the project root.
    pub fn add_library(&self, name: &str, package: &str) -> PathBuf {
        let dir = PathBuf::from("libraries").join(name);
        let base = format!("libraries/{}", name);
        self.write(
            &format!("{}/AndroidManifest.xml", base),
            &format!(r#"<manifest package="{}"/>"#, package),
        );
        self.write(
            &format!("{}/res/values/strings.xml", base),
            &format!(r#"<resources><string name="{}_title">{}</string></resources>"#, name, name),
        );
        self.write(&format!("{}/assets/{}.txt", base, name), name);
        dir
    }

    pub fn config(&self) -> BuildConfig {
        let mut config = BuildConfig::default();
        config.tools.javac = self.tools.join("javac");
        config.tools.dx = self.tools.join("dx");
        config.tools.dex_merger = self.tools.join("dex-merger");
        config.tools.aapt = self.tools.join("aapt");
        config.tools.apksigner = self.tools.join("apksigner");
        config.tools.keytool = self.tools.join("keytool");
        config.tools.android_jar = Some(self.tools.join("android.jar"));
        config
    }

    pub fn project(&self) -> AndroidProject {
        AndroidProject::new(&self.root, &ProjectSettings::default())
    }

    pub fn debug_keystore(&self) -> PathBuf {
        self.temp.path().join("home/.android/debug.keystore")
    }

    /// A builder signing with a debug keystore inside the temp dir.
    pub fn builder(&self) -> AndroidBuilder {
        self.builder_with(self.config())
    }

    pub fn builder_with(&self, config: BuildConfig) -> AndroidBuilder {
        let pool = Arc::new(WorkerPool::new(2).unwrap());
        let project = AndroidProject::new(&self.root, &config.project);
        AndroidBuilder::with_pool(project, config, pool)
            .unwrap()
            .with_debug_signing(SigningConfig::debug_at(self.debug_keystore()))
    }

    /// Arguments of every `aapt` run, one line per run.
    pub fn aapt_runs(&self) -> Vec<String> {
        fs::read_to_string(self.tools.join("aapt.args"))
            .map(|s| s.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// Number of times `tool` ran.
    pub fn calls(&self, tool: &str) -> usize {
        fs::read_to_string(self.tools.join(format!("{}.calls", tool)))
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    pub fn tools_dir(&self) -> &Path {
        &self.tools
    }
}
