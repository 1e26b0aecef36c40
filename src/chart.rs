//! Chart artifact pipeline: extract-by-name, then trusted persistence.
//!
//! Charting code runs through the execution engine like any other snippet
//! and is expected to bind a matplotlib figure to a caller-specified
//! variable name; it performs no file I/O of its own (the guarded open has
//! no route to the images directory anyway). The trusted layer then pulls
//! the figure out of the namespace, saves it under a collision-free
//! filename and hands back a URL reference.
//!
//! Every entry point here returns a user-facing string, never an error:
//! the agent surfaces these messages directly to the end user.

use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;

use chrono::Local;
use pyo3::prelude::*;
use pyo3::types::PyDict;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::Error;
use crate::sandbox::PythonSandbox;

/// Fixed prefix for chart failures the rewriter does not recognize.
const FAILURE_PREFIX: &str = "Chart code execution failed";

/// CJK-capable font candidates per platform, tried in order.
const FONT_CANDIDATES: &[(&str, &[&str])] = &[
    (
        "macos",
        &["PingFang SC", "Heiti TC", "STHeiti", "Arial Unicode MS"],
    ),
    (
        "windows",
        &["Microsoft YaHei", "SimHei", "SimSun", "FangSong"],
    ),
    (
        "linux",
        &[
            "WenQuanYi Micro Hei",
            "Droid Sans Fallback",
            "Noto Sans CJK SC",
        ],
    ),
];

/// Persists figures extracted from the sandbox namespace and builds their
/// public references.
#[derive(Debug, Clone)]
pub struct ChartRenderer {
    images_dir: PathBuf,
    base_url: String,
}

impl ChartRenderer {
    /// Creates a renderer saving into `images_dir` and serving under
    /// `{base_url}/images/`.
    ///
    /// Construction also probes for a CJK-capable font and, when one is
    /// found, pushes it to the front of matplotlib's sans-serif list so
    /// non-Latin axis labels render instead of showing up as boxes.
    #[must_use]
    pub fn new(images_dir: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Python::attach(configure_cjk_font);
        Self {
            images_dir: images_dir.into(),
            base_url,
        }
    }

    /// Creates a renderer from the environment: `SANDBOX_IMAGES_DIR`
    /// (default `images`) and `API_URL` (default `http://localhost:2024`).
    #[must_use]
    pub fn from_env() -> Self {
        let images_dir =
            std::env::var_os("SANDBOX_IMAGES_DIR").map_or_else(|| PathBuf::from("images"), Into::into);
        let base_url =
            std::env::var("API_URL").unwrap_or_else(|_| String::from("http://localhost:2024"));
        Self::new(images_dir, base_url)
    }

    /// The directory artifacts are written to.
    #[must_use]
    pub fn images_dir(&self) -> &std::path::Path {
        &self.images_dir
    }

    /// Runs charting code in the sandbox, extracts the figure bound to
    /// `var_name` and persists it.
    ///
    /// Returns a markdown image reference on success and a descriptive
    /// message on any failure. Rendering-library state mutated for this
    /// call (open figures, active backend) is reset on every path.
    #[instrument(skip(self, sandbox, code))]
    pub fn render(&self, sandbox: &PythonSandbox, code: &str, var_name: &str) -> String {
        Python::attach(|py| {
            let matplotlib = match py.import("matplotlib") {
                Ok(module) => module,
                Err(err) => return format!("{FAILURE_PREFIX}: matplotlib is unavailable ({err})"),
            };

            // Non-interactive backend for file output; the previous backend
            // is restored below no matter how rendering went.
            let previous_backend: Option<String> = matplotlib
                .call_method0("get_backend")
                .ok()
                .and_then(|backend| backend.extract().ok());
            if let Err(err) = matplotlib.call_method1("use", ("Agg",)) {
                warn!(error = %err, "could not switch matplotlib backend");
            }

            let message = self.render_inner(py, sandbox, code, var_name);

            if let Ok(plt) = py.import("matplotlib.pyplot") {
                let _ = plt.call_method1("close", ("all",));
            }
            if let Some(backend) = previous_backend {
                let _ = matplotlib.call_method1("use", (backend,));
            }

            message
        })
    }

    fn render_inner(
        &self,
        py: Python<'_>,
        sandbox: &PythonSandbox,
        code: &str,
        var_name: &str,
    ) -> String {
        if let Err(err) = sandbox.execute(code, None) {
            return rewrite_chart_error(&err.to_string());
        }

        let figure = match sandbox.get_global(var_name) {
            Ok(figure) => figure,
            Err(Error::GlobalNotFound { .. }) => {
                return format!(
                    "Figure object not found: the variable '{var_name}' was never assigned. \
                     Make sure the plotting code binds the figure to that name."
                );
            }
            Err(err) => return rewrite_chart_error(&err.to_string()),
        };

        // Truthiness, not just None: a figure-shaped hole (0, [], "") gets
        // the same descriptive message instead of a raw savefig failure.
        let figure = figure.bind(py);
        match figure.is_truthy() {
            Ok(true) => {}
            Ok(false) => {
                let what = if figure.is_none() {
                    "None"
                } else {
                    "an empty object"
                };
                return format!(
                    "Figure object is empty: the variable '{var_name}' exists but is {what}."
                );
            }
            Err(err) => return rewrite_chart_error(&err.to_string()),
        }

        match self.persist(py, figure, var_name) {
            Ok(url) => format!("Figure saved: ![{var_name}]({url})"),
            Err(err) => format!("Failed to save figure: {err}"),
        }
    }

    /// Trusted persistence step: runs outside any sandbox policy.
    fn persist(&self, py: Python<'_>, figure: &Bound<'_, PyAny>, var_name: &str) -> PyResult<String> {
        fs::create_dir_all(&self.images_dir).map_err(|err| {
            pyo3::exceptions::PyIOError::new_err(format!(
                "cannot create images directory {}: {err}",
                self.images_dir.display()
            ))
        })?;

        let filename = artifact_filename(var_name);
        let path = self.images_dir.join(&filename);

        let kwargs = PyDict::new(py);
        kwargs.set_item("bbox_inches", "tight")?;
        kwargs.set_item("dpi", 300)?;
        figure.call_method(
            "savefig",
            (path.to_string_lossy().into_owned(),),
            Some(&kwargs),
        )?;

        info!(file = %path.display(), "chart artifact saved");
        Ok(format!("{}/images/{}", self.base_url, filename))
    }
}

/// Collision-free artifact name: variable, timestamp, short random suffix.
fn artifact_filename(var_name: &str) -> String {
    let timestamp = Local::now().format("%Y%m%d_%H%M%S");
    let id = Uuid::new_v4().simple().to_string();
    format!("{var_name}_{timestamp}_{}.png", &id[..8])
}

/// Rewrites one recognized failure signature into an actionable hint;
/// everything else keeps the fixed prefix.
fn rewrite_chart_error(message: &str) -> String {
    let normalized = message.to_lowercase();
    if normalized.contains("loop of ufunc") && normalized.contains("type str") {
        return format!(
            "{FAILURE_PREFIX}: a math operation ran on a string/categorical column. \
             Convert the column to numeric first (for example \
             pd.to_numeric(df[col], errors='coerce')) and plot the cleaned frame."
        );
    }
    format!("{FAILURE_PREFIX}: {message}")
}

/// Puts the first available CJK-capable font at the front of matplotlib's
/// sans-serif list. Best effort; failures only log.
fn configure_cjk_font(py: Python<'_>) {
    let Ok(font_manager) = py.import("matplotlib.font_manager") else {
        return;
    };

    let available: BTreeSet<String> = match font_manager
        .getattr("fontManager")
        .and_then(|manager| manager.getattr("ttflist"))
        .and_then(|fonts| {
            fonts.try_iter()?.map(|font| {
                font.and_then(|f| f.getattr("name")).and_then(|n| n.extract())
            }).collect()
        }) {
        Ok(names) => names,
        Err(err) => {
            warn!(error = %err, "could not enumerate matplotlib fonts");
            return;
        }
    };

    let candidates = FONT_CANDIDATES
        .iter()
        .find(|(os, _)| *os == std::env::consts::OS)
        .map(|(_, fonts)| *fonts)
        .unwrap_or_default();

    let Some(font) = candidates.iter().find(|name| available.contains(**name)) else {
        warn!(
            ?candidates,
            "no CJK-capable font found; non-Latin chart labels may not render"
        );
        return;
    };

    let result: PyResult<()> = (|| {
        let rc_params = py.import("matplotlib")?.getattr("rcParams")?;
        let mut family: Vec<String> = rc_params.get_item("font.sans-serif")?.extract()?;
        if family.first().map(String::as_str) != Some(*font) {
            family.insert(0, (*font).to_string());
            rc_params.set_item("font.sans-serif", family)?;
        }
        rc_params.set_item("axes.unicode_minus", false)?;
        Ok(())
    })();

    match result {
        Ok(()) => debug!(font, "CJK font configured for charts"),
        Err(err) => warn!(error = %err, "could not configure CJK font"),
    }
}
