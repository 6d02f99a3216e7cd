use chrono::Local;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

use super::detect::PatientDetector;
use super::strategies::{self, Strategies};
use super::{StageEnv, WorkflowState};
use crate::errors::AutomationError;
use crate::locator::{Locator, Requirement};
use crate::pipeline::StageContext;
use crate::surface::RemoteElements;
use crate::sync::{analysis_fields, patient_fields, AnalysisResult, SyncOperation};
use crate::wait::{poll_until, PollSpec};

type Ctx<'a, 'b> = &'a mut StageContext<'b, WorkflowState>;

// Quiet period before trusting the absence of any progress indicator
const INDICATOR_GRACE: Duration = Duration::from_secs(2);
const DOWNLOAD_POLL: Duration = Duration::from_secs(1);

impl StageEnv {
    fn elements(&self) -> RemoteElements<'_> {
        RemoteElements::new(self.surface.as_ref())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.remote.base_url.trim_end_matches('/'), path)
    }

    /// Locator for targets that appear only after a page transition.
    fn waiting_locator(&self) -> Locator {
        self.locator
            .require(Requirement::Present)
            .set_default_timeout(self.config.request_timeout())
    }

    fn settle(&self, ctx: &StageContext<'_, WorkflowState>) -> Result<(), AutomationError> {
        ctx.clock().sleep(self.config.automation.wait_time());
        ctx.checkpoint()
    }

    /// Click `strategies` if anything matches; report whether it did.
    fn click_if_present(
        &self,
        ctx: &StageContext<'_, WorkflowState>,
        target: &str,
        strategies: &Strategies,
    ) -> Result<bool, AutomationError> {
        let elements = self.elements();
        match self.locator.try_resolve(target, &elements, strategies)? {
            Some(located) => {
                self.surface.click(&located.target)?;
                Ok(true)
            }
            None => {
                ctx.warn(format!("{target} not found, skipped"));
                Ok(false)
            }
        }
    }

    fn fill_if_present(
        &self,
        ctx: &StageContext<'_, WorkflowState>,
        target: &str,
        strategies: &Strategies,
        text: &str,
    ) -> Result<bool, AutomationError> {
        match self
            .elements()
            .fill(&self.locator, target, strategies, text)
        {
            Ok(_) => Ok(true),
            Err(AutomationError::LocatorNotFound { .. }) => {
                ctx.warn(format!("{target} not found, skipped"));
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

pub(crate) fn sign_in(env: &StageEnv, ctx: Ctx) -> Result<String, AutomationError> {
    let credentials = env.config.credentials()?;
    let elements = env.elements();

    env.surface.navigate(&env.url(""))?;
    env.settle(ctx)?;

    if elements.exists(&env.locator, &strategies::login_success())? {
        return Ok(format!("Already signed in as {}", credentials.username));
    }

    env.click_if_present(ctx, "login link", &strategies::login_link())?;
    env.settle(ctx)?;

    elements.fill(
        &env.locator,
        "email field",
        &strategies::email_field(),
        &credentials.username,
    )?;
    elements.fill(
        &env.locator,
        "password field",
        &strategies::password_field(),
        &credentials.password,
    )?;
    elements.click(&env.locator, "login button", &strategies::login_button())?;

    env.waiting_locator()
        .resolve("login confirmation", &elements, &strategies::login_success())?;
    ctx.success(format!("Signed in as {}", credentials.username));
    Ok(format!("Signed in as {}", credentials.username))
}

pub(crate) fn register_patient(env: &StageEnv, ctx: Ctx) -> Result<String, AutomationError> {
    let patient = ctx.state.patient.clone();
    patient.validate()?;
    let elements = env.elements();

    if !env.click_if_present(ctx, "new patient button", &strategies::new_patient_button())? {
        env.surface.navigate(&env.url("/patients/new"))?;
    }
    env.settle(ctx)?;

    let (last, first) = patient.name_parts();
    elements.fill(
        &env.locator,
        "patient id field",
        &strategies::patient_id_field(),
        &patient.chart_no,
    )?;
    elements.fill(
        &env.locator,
        "first name field",
        &strategies::first_name_field(),
        &first,
    )?;
    elements.fill(
        &env.locator,
        "last name field",
        &strategies::last_name_field(),
        &last,
    )?;

    if env.click_if_present(ctx, "race list", &strategies::race_select())? {
        env.click_if_present(ctx, "asian race option", &strategies::race_asian_option())?;
    }
    match patient.gender {
        Some(gender) => {
            if env.click_if_present(ctx, "gender list", &strategies::gender_select())? {
                env.click_if_present(ctx, "gender option", &strategies::gender_option(gender))?;
            }
        }
        None => debug!("No gender recorded, leaving the field untouched"),
    }

    elements.fill(
        &env.locator,
        "birth date field",
        &strategies::birth_date_field(),
        &patient.birth_date_text(),
    )?;
    env.click_if_present(ctx, "agreement checkbox", &strategies::agreement_checkbox())?;
    elements.click(
        &env.locator,
        "create patient button",
        &strategies::create_patient_button(),
    )?;
    env.settle(ctx)?;
    ctx.success(format!("Patient {} ({}) created", patient.name, patient.chart_no));

    if let Some(sync) = &env.sync {
        let fields = patient_fields(
            &patient,
            &env.config.data_store.operator_name,
            Some(ctx.state.images.len()),
            Local::now(),
        );
        match sync.submit(SyncOperation::create_patient(fields)) {
            Ok(receipt) => ctx.state.store_record_id = receipt.record_id,
            Err(e) => {
                ctx.warn(format!("Patient record not synced yet: {e}"));
                ctx.state.sync_errors.push(e.to_string());
            }
        }
    }

    Ok(format!("Registered {} ({})", patient.name, patient.chart_no))
}

pub(crate) fn select_patient(env: &StageEnv, ctx: Ctx) -> Result<String, AutomationError> {
    let elements = env.elements();
    let detector = PatientDetector::new(
        &elements,
        &env.locator,
        &env.url("/dashboard"),
        PollSpec::new(env.config.request_timeout(), env.config.automation.wait_time()),
    );
    let detection = detector.select(&ctx.state.patient)?;
    env.settle(ctx)?;

    let message = format!("Opened patient via {}", detection.method);
    ctx.state.detection = Some(detection);
    Ok(message)
}

pub(crate) fn create_record(env: &StageEnv, ctx: Ctx) -> Result<String, AutomationError> {
    let elements = env.elements();
    let today = Local::now().format("%Y-%m-%d").to_string();
    let name = ctx.state.patient.name.clone();

    elements.click(&env.locator, "new record button", &strategies::new_record_button())?;
    env.settle(ctx)?;

    env.fill_if_present(ctx, "record date field", &strategies::record_date_field(), &today)?;
    let title = format!("{name} - 초진 ({today})");
    if !env.fill_if_present(ctx, "record title field", &strategies::record_title_field(), &title)? {
        let memo = format!("환자: {name}\n날짜: {today}\n타입: 초진");
        env.fill_if_present(ctx, "record memo field", &strategies::record_memo_field(), &memo)?;
    }

    elements.click(
        &env.locator,
        "confirm record button",
        &strategies::confirm_record_button(),
    )?;
    env.waiting_locator()
        .resolve("image upload area", &elements, &strategies::record_ready())?;
    Ok(format!("Record '{title}' ready for images"))
}

pub(crate) fn upload_images(env: &StageEnv, ctx: Ctx) -> Result<String, AutomationError> {
    let images = ctx.state.images.clone();
    if images.is_empty() {
        return Err(AutomationError::InvalidArgument(
            "no images to upload".to_string(),
        ));
    }
    let elements = env.elements();
    let file_inputs = env.locator.require(Requirement::Present);

    for image in &images {
        ctx.checkpoint()?;
        let input = file_inputs.resolve(
            &format!("{} upload input", image.kind),
            &elements,
            &strategies::upload_input(image.kind.input_name()),
        )?;
        env.surface.attach_file(&input.target, &image.path)?;

        match env
            .waiting_locator()
            .try_resolve("upload confirmation", &elements, &strategies::upload_confirmation())?
        {
            Some(_) => ctx.info(format!("Uploaded {} {}", image.kind, image.path.display())),
            None => ctx.warn(format!(
                "No upload confirmation for {}, continuing",
                image.path.display()
            )),
        }
    }
    Ok(format!("Uploaded {} image(s)", images.len()))
}

pub(crate) fn start_analysis(env: &StageEnv, ctx: Ctx) -> Result<String, AutomationError> {
    let elements = env.elements();
    elements.click(&env.locator, "analyze button", &strategies::analyze_button())?;

    if env
        .locator
        .require(Requirement::Present)
        .try_resolve("analysis progress", &elements, &strategies::analysis_started())?
        .is_none()
    {
        ctx.warn("Analysis started without a visible progress indicator");
    }
    ctx.state.analysis_started = true;
    Ok("Analysis started".to_string())
}

pub(crate) fn wait_analysis(env: &StageEnv, ctx: Ctx) -> Result<String, AutomationError> {
    let elements = env.elements();
    let automation = &env.config.automation;
    let spec = PollSpec::new(automation.max_analysis_wait(), automation.poll_interval());
    let started = ctx.clock().now();
    let deadline = started + spec.timeout;
    let completion = strategies::completion_indicator();
    let progress = strategies::progress_indicator();
    let download = strategies::download_button();

    poll_until(ctx.clock(), ctx.control(), spec, "analysis completion", || {
        if elements.exists(&env.locator, &completion)? {
            return Ok(Some(()));
        }
        if elements.exists(&env.locator, &progress)? {
            let waited = ctx.clock().now().saturating_duration_since(started);
            ctx.info(format!("Analysis in progress ({}s)", waited.as_secs()));
            return Ok(None);
        }
        // No indicator either way: give the page a moment, then trust the download button.
        // The grace period is part of the bounded wait.
        let left = deadline.saturating_duration_since(ctx.clock().now());
        ctx.clock().sleep(INDICATOR_GRACE.min(left));
        if elements.exists(&env.locator, &download)? {
            return Ok(Some(()));
        }
        Ok(None)
    })?;

    let waited = ctx.clock().now().saturating_duration_since(started);
    ctx.state.analysis_complete = true;
    ctx.success("Analysis complete");
    Ok(format!("Analysis finished after {}s", waited.as_secs()))
}

pub(crate) fn download_report(env: &StageEnv, ctx: Ctx) -> Result<String, AutomationError> {
    let folder = env.config.paths.report_folder.clone();
    std::fs::create_dir_all(&folder)?;
    let before: HashSet<PathBuf> = pdfs_in(&folder)?.into_iter().map(|(p, _)| p).collect();

    env.elements()
        .click(&env.locator, "download button", &strategies::download_button())?;

    let downloaded = poll_until(
        ctx.clock(),
        ctx.control(),
        PollSpec::new(env.config.request_timeout(), DOWNLOAD_POLL),
        "report download",
        || {
            Ok(pdfs_in(&folder)?
                .into_iter()
                .filter(|(path, _)| !before.contains(path))
                .max_by_key(|(_, modified)| *modified)
                .map(|(path, _)| path))
        },
    );
    let source = match downloaded {
        Ok(path) => path,
        Err(AutomationError::Timeout(detail)) => {
            warn!("{}, falling back to the newest report", detail);
            newest_pdf(&folder)?.ok_or_else(|| {
                AutomationError::Timeout(format!(
                    "no PDF report found in {}",
                    folder.display()
                ))
            })?
        }
        Err(e) => return Err(e),
    };

    let patient = &ctx.state.patient;
    let file_name = report_file_name(&patient.name, &patient.chart_no, Local::now().date_naive());
    let target = folder.join(file_name);
    if source != target {
        std::fs::rename(&source, &target)?;
    }
    ctx.success(format!("Report saved to {}", target.display()));
    ctx.state.report_path = Some(target.clone());
    Ok(format!("Report saved as {}", target.display()))
}

pub(crate) fn sync_results(env: &StageEnv, ctx: Ctx) -> Result<String, AutomationError> {
    let Some(sync) = &env.sync else {
        return Ok("Data store not configured, skipped".to_string());
    };

    let summary = sync.replay_pending()?;
    if summary.processed + summary.failed > 0 {
        ctx.info(format!(
            "Replayed offline queue: {} sent, {} failed, {} left",
            summary.processed, summary.failed, summary.remaining
        ));
    }
    for error in summary.errors() {
        ctx.error(error.to_string());
        ctx.state.sync_errors.push(error.to_string());
    }

    let now = Local::now();
    let result = AnalysisResult {
        report_path: ctx.state.report_path.clone(),
        ..Default::default()
    };
    let operation = match &ctx.state.store_record_id {
        Some(record_id) => SyncOperation::update_result(record_id, analysis_fields(&result, now)),
        None => {
            let mut fields = patient_fields(
                &ctx.state.patient,
                &env.config.data_store.operator_name,
                Some(ctx.state.images.len()),
                now,
            );
            fields.extend(analysis_fields(&result, now));
            SyncOperation::create_patient(fields)
        }
    };

    match sync.submit(operation) {
        Ok(receipt) => {
            if ctx.state.store_record_id.is_none() {
                ctx.state.store_record_id = receipt.record_id;
            }
            Ok("Results synced to the data store".to_string())
        }
        Err(e) => {
            ctx.warn(format!("Results queued for a later sync: {e}"));
            ctx.state.sync_errors.push(e.to_string());
            Ok("Results queued for a later sync".to_string())
        }
    }
}

/// `<name>_<chart>_<YYYYMMDD>.pdf` with path-hostile characters replaced.
pub(crate) fn report_file_name(name: &str, chart_no: &str, date: chrono::NaiveDate) -> String {
    let raw = format!("{}_{}_{}.pdf", name.trim(), chart_no.trim(), date.format("%Y%m%d"));
    raw.chars()
        .map(|c| match c {
            '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c => c,
        })
        .collect()
}

fn pdfs_in(folder: &Path) -> Result<Vec<(PathBuf, SystemTime)>, AutomationError> {
    let mut found = Vec::new();
    for entry in std::fs::read_dir(folder)? {
        let entry = entry?;
        let path = entry.path();
        let is_pdf = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("pdf"));
        if !is_pdf || !entry.file_type()?.is_file() {
            continue;
        }
        let modified = entry.metadata()?.modified()?;
        found.push((path, modified));
    }
    Ok(found)
}

fn newest_pdf(folder: &Path) -> Result<Option<PathBuf>, AutomationError> {
    Ok(pdfs_in(folder)?
        .into_iter()
        .max_by_key(|(_, modified)| *modified)
        .map(|(path, _)| path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn report_name_replaces_path_characters() {
        let date = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        assert_eq!(report_file_name("홍길동", "A-77", date), "홍길동_A-77_20240501.pdf");
        assert_eq!(report_file_name("Kim", "12/34", date), "Kim_12_34_20240501.pdf");
    }

    #[test]
    fn only_pdf_files_are_listed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.pdf"), b"%PDF").unwrap();
        std::fs::write(dir.path().join("b.PDF"), b"%PDF").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("dir.pdf")).unwrap();

        let mut names: Vec<String> = pdfs_in(dir.path())
            .unwrap()
            .into_iter()
            .map(|(p, _)| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["a.pdf", "b.PDF"]);
    }
}
