use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use pgoforge::ErrorKind;
use pgoforge::builder::{BuildOutput, BuildRequest, ExternalBuilder};
use pgoforge::config::ConfigDoc;
use pgoforge::executor::{ExecCtx, StdoutSink};
use pgoforge::gate::{AssumeYes, Decline};

const PKGBUILD: &str = r#"
pkgbase=linux-pgo
pkgver=6.12.1
: "${_cpusched:=eevdf}"
: "${_HZ_ticks:=300}"
: "${_tickrate:=idle}"
: "${_preempt:=voluntary}"
: "${_hugepage:=madvise}"
: "${_build_debug:=no}"
: "${_autofdo:=no}"
: "${_propeller:=no}"

source=(
  "linux-${pkgver}.tar.xz"
  "config"
)
sha256sums=('aaa' 'bbb')

if [[ -n "$_autofdo_profile_name" ]]; then
  source+=("$_autofdo_profile_name")
  sha256sums+=('SKIP')
fi

build() {
  make -j"$(nproc)"
}
"#;

/// Writes a package into the work dir and remembers the environment it got.
#[derive(Default)]
struct FakeBuilder {
    env: Mutex<Option<BTreeMap<String, String>>>,
}

impl ExternalBuilder for FakeBuilder {
    fn build(&self, req: &BuildRequest, ctx: &ExecCtx) -> pgoforge::Result<BuildOutput> {
        if let Ok(mut g) = self.env.lock() {
            *g = Some(req.env.clone());
        }
        let pkg = req.work_dir.join("linux-pgo-6.12.1-1-x86_64.pkg.tar.zst");
        fs::write(&pkg, b"package").unwrap();
        ctx.log("fake build done");
        Ok(BuildOutput {
            artifacts: vec![pkg],
        })
    }
}

struct Fixture {
    _tmp: tempfile::TempDir,
    root: PathBuf,
    build_file: PathBuf,
}

fn fixture(pkgbuild: &str, extra: &str) -> Fixture {
    let tmp = tempfile::tempdir().expect("tempdir");
    let root = tmp.path().to_path_buf();
    fs::create_dir_all(root.join("linux-pgo")).unwrap();
    fs::write(root.join("linux-pgo/PKGBUILD"), pkgbuild).unwrap();
    fs::write(root.join("kernel.afdo"), b"profile").unwrap();

    let build_file = root.join("server.toml");
    let raw = format!(
        r#"
[workspace]
root_dir = "{}"
build_dir = "build"
out_dir = "out"

[kernel]
descriptor = "linux-pgo/PKGBUILD"
evaluator = "static"
allow_root = true
min_free_gib = 0
{extra}
"#,
        root.display()
    );
    fs::write(&build_file, raw).unwrap();
    Fixture {
        _tmp: tmp,
        root,
        build_file,
    }
}

fn run(doc: &ConfigDoc, ctx: &mut ExecCtx) -> pgoforge::Result<()> {
    let plan = pgoforge::modules::plan_for(doc)?;
    let reg = pgoforge::executor::builtin_registry()?;
    pgoforge::executor::execute_plan(doc, &plan, &reg, ctx)
}

fn sink(fx: &Fixture) -> Arc<StdoutSink> {
    Arc::new(StdoutSink::with_error_logs_root(fx.root.join("error-logs")))
}

fn exec_ctx(fx: &Fixture, dry_run: bool, builder: Arc<FakeBuilder>) -> ExecCtx {
    ExecCtx::new(dry_run, sink(fx))
        .with_gate(Arc::new(AssumeYes))
        .with_builder(builder)
}

fn load(path: &Path) -> ConfigDoc {
    pgoforge::config::load(path).expect("load config")
}

#[test]
fn autofdo_build_collects_packages_and_report() {
    let fx = fixture(PKGBUILD, "\n[kernel.profiles]\nautofdo = \"kernel.afdo\"\n");
    let doc = load(&fx.build_file);
    let builder = Arc::new(FakeBuilder::default());
    let mut ctx = exec_ctx(&fx, false, builder.clone());
    run(&doc, &mut ctx).expect("pipeline");

    let env = builder.env.lock().unwrap().clone().expect("builder ran");
    assert_eq!(env.get("_autofdo").map(String::as_str), Some("yes"));
    assert_eq!(env.get("_build_debug").map(String::as_str), Some("yes"));
    assert_eq!(env.get("_cpusched").map(String::as_str), Some("bore"));
    assert_eq!(
        env.get("_autofdo_profile_name").map(PathBuf::from),
        Some(fx.root.join("kernel.afdo"))
    );

    let out = fx.root.join("out/server");
    assert!(out.join("packages/linux-pgo-6.12.1-1-x86_64.pkg.tar.zst").is_file());

    let report: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(out.join("build-report.json")).unwrap()).unwrap();
    assert_eq!(report["plan"]["mode"], "autofdo-optimized");
    assert_eq!(report["artifacts"][0]["size"], 7);
    assert_eq!(report["artifacts"][0]["sha256"].as_str().map(str::len), Some(64));
    assert_eq!(report["verification"]["evaluator"], "static");
}

#[test]
fn dry_run_builds_nothing() {
    let fx = fixture(PKGBUILD, "");
    let doc = load(&fx.build_file);
    let builder = Arc::new(FakeBuilder::default());
    let mut ctx = exec_ctx(&fx, true, builder.clone());
    run(&doc, &mut ctx).expect("dry run");

    assert!(builder.env.lock().unwrap().is_none());
    assert!(!fx.root.join("out").exists());
    assert!(!fx.root.join("build").exists());
    // Decision tasks still ran.
    assert!(ctx.build_plan().is_some());
    assert!(ctx.verification().is_some());
}

#[test]
fn declined_confirmation_cancels_before_build() {
    let fx = fixture(PKGBUILD, "");
    let doc = load(&fx.build_file);
    let builder = Arc::new(FakeBuilder::default());
    let mut ctx = ExecCtx::new(false, sink(&fx))
        .with_gate(Arc::new(Decline))
        .with_builder(builder.clone());

    let err = run(&doc, &mut ctx).unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(err.kind().exit_code(), 0);
    assert!(builder.env.lock().unwrap().is_none());
    assert!(ctx.verification().is_none());
}

#[test]
fn lone_propeller_profile_fails_before_any_work() {
    let fx = fixture(
        PKGBUILD,
        "\n[kernel.profiles]\nautofdo = \"kernel.afdo\"\npropeller_cc = \"kernel.afdo\"\n",
    );
    let doc = load(&fx.build_file);
    let builder = Arc::new(FakeBuilder::default());
    let mut ctx = exec_ctx(&fx, false, builder.clone());

    let err = run(&doc, &mut ctx).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidProfileCombination);
    assert_eq!(err.kind().exit_code(), 2);
    assert!(builder.env.lock().unwrap().is_none());
}

#[test]
fn checksum_count_mismatch_stops_the_build() {
    let broken = PKGBUILD.replace("sha256sums=('aaa' 'bbb')", "sha256sums=('aaa')");
    let fx = fixture(&broken, "");
    let doc = load(&fx.build_file);
    let builder = Arc::new(FakeBuilder::default());
    let mut ctx = exec_ctx(&fx, false, builder.clone());

    let err = run(&doc, &mut ctx).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StructuralMismatch);
    assert_eq!(err.kind().exit_code(), 3);
    assert!(err.to_string().contains("kernel.validate"), "{err}");
    assert!(builder.env.lock().unwrap().is_none());
}

#[test]
fn hard_coded_scheduler_is_a_mismatch() {
    let pinned = PKGBUILD.replace(": \"${_cpusched:=eevdf}\"", "_cpusched=eevdf");

    let fx = fixture(&pinned, "");
    let doc = load(&fx.build_file);
    let mut ctx = exec_ctx(&fx, false, Arc::new(FakeBuilder::default()));
    run(&doc, &mut ctx).expect("mismatch only warns by default");
    let report = ctx.verification().expect("report");
    let m: Vec<_> = report.mismatches().map(|o| o.variable.clone()).collect();
    assert_eq!(m, ["_cpusched"]);

    let fx = fixture(&pinned, "fail_on_mismatch = true\n");
    let doc = load(&fx.build_file);
    let builder = Arc::new(FakeBuilder::default());
    let mut ctx = exec_ctx(&fx, false, builder.clone());
    let err = run(&doc, &mut ctx).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OverrideMismatch);
    assert_eq!(err.kind().exit_code(), 6);
    assert!(builder.env.lock().unwrap().is_none());
}

#[test]
fn missing_profile_file_is_a_precondition_failure() {
    let fx = fixture(PKGBUILD, "\n[kernel.profiles]\nautofdo = \"missing.afdo\"\n");
    let doc = load(&fx.build_file);
    let mut ctx = exec_ctx(&fx, false, Arc::new(FakeBuilder::default()));

    let err = run(&doc, &mut ctx).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PreconditionFailure);
    assert!(err.to_string().contains("missing.afdo"), "{err}");
    assert!(!fx.root.join("build").exists());
}

#[test]
fn overlay_is_written_next_to_descriptor() {
    let fx = fixture(
        PKGBUILD,
        "\n[overlay]\nmodules_file = \"mods.txt\"\nvariant_dir = \"server\"\n",
    );
    fs::write(fx.root.join("mods.txt"), "nvme 1 0 - Live 0x0\nsnd_hda_intel\n").unwrap();
    fs::create_dir(fx.root.join("linux-pgo/server")).unwrap();
    let doc = load(&fx.build_file);
    let builder = Arc::new(FakeBuilder::default());
    let mut ctx = exec_ctx(&fx, false, builder.clone());
    run(&doc, &mut ctx).expect("pipeline");

    let overlay = fs::read_to_string(fx.root.join("linux-pgo/server/modules.config")).unwrap();
    assert!(overlay.contains("CONFIG_BLK_DEV_NVME=y"));
    assert!(overlay.contains("#   snd_hda_intel"));

    let env = builder.env.lock().unwrap().clone().expect("builder ran");
    assert_eq!(env.get("_module_overlay").map(String::as_str), Some("yes"));
}
