//! Ordered selector lists for every remote target the workflow touches.
//! Earlier entries are the ones observed on the live site; later ones are
//! progressively looser fallbacks.

use crate::locator::{LocatorStrategy, TargetKind};
use crate::record::Gender;
use crate::selector::Selector;

pub type Strategies = Vec<LocatorStrategy<Selector>>;

/// Strategy list with priorities following list order.
pub fn table<S: AsRef<str>>(selectors: &[S]) -> Strategies {
    selectors
        .iter()
        .enumerate()
        .map(|(i, s)| {
            LocatorStrategy::new(
                i as u32,
                TargetKind::RemoteElement,
                Selector::from(s.as_ref()),
            )
        })
        .collect()
}

pub fn login_link() -> Strategies {
    table(&[
        "link:로그인",
        "partial-link:로그인",
        "//a[contains(text(), '로그인')]",
        "//button[contains(text(), '로그인')]",
        "a[href*='login']",
        "//a[@href='/login']",
        "//a[@href='#login']",
        "link:Login",
        "partial-link:Login",
        "//a[contains(text(), 'Login')]",
        "//button[contains(text(), 'Login')]",
    ])
}

pub fn email_field() -> Strategies {
    table(&[
        "id:id_email",
        "input#id_email.textinput.form-control",
        "//label[contains(text(), '이메일')]/following-sibling::input",
        "//label[contains(text(), '이메일')]/parent::*/input",
        "input[type='email']",
        "input[placeholder*='이메일']",
        "input[placeholder*='email']",
        "input[placeholder*='Email']",
        "name:email",
        "name:username",
        "name:user_email",
        "id:email",
        "id:username",
        "input[type='text']:first-of-type",
    ])
}

pub fn password_field() -> Strategies {
    table(&[
        "id:id_password",
        "input#id_password.passwordinput.form-control",
        "//label[contains(text(), '비밀번호')]/following-sibling::input",
        "//label[contains(text(), '비밀번호')]/parent::*/input",
        "input[type='password']",
        "input[placeholder*='비밀번호']",
        "input[placeholder*='password']",
        "input[placeholder*='Password']",
        "name:password",
        "name:passwd",
        "id:password",
    ])
}

pub fn login_button() -> Strategies {
    table(&[
        "input.btn.btn-home-color.btn-block",
        "input[name='로그인']",
        "//input[@value='로그인']",
        "//button[contains(text(), '로그인')]",
        "button[type='submit']",
        "//input[@type='submit']",
        "//button[contains(text(), 'Login')]",
        "//input[@value='Login']",
        ".btn-login",
        "#loginButton",
        "form button[type='submit']:first-of-type",
        "form input[type='submit']:first-of-type",
    ])
}

/// Anything that only appears once signed in.
pub fn login_success() -> Strategies {
    table(&[
        "class:dashboard",
        "class:main-content",
        "class:user-menu",
        "//a[contains(text(), 'Logout')]",
        "//a[contains(text(), '로그아웃')]",
        "//button[contains(text(), 'Logout')]",
        "//div[contains(@class, 'user')]",
        "//div[contains(@class, 'profile')]",
    ])
}

pub fn new_patient_button() -> Strategies {
    table(&[
        "//span[contains(text(), '+ 신규 환자')]",
        "//button[contains(text(), '+ 신규 환자')]",
        "//a[contains(text(), '+ 신규 환자')]",
        "span[class*='full-text']",
        "//span[contains(text(), '신규 환자')]",
        "//button[contains(text(), '신규 환자')]",
        "//a[contains(text(), '신규 환자')]",
        "//span[contains(text(), '신규 등록')]",
        "//button[contains(text(), '신규 등록')]",
        "//a[contains(text(), '신규 등록')]",
        "partial-link:신규",
        "partial-link:등록",
    ])
}

pub fn patient_id_field() -> Strategies {
    table(&[
        "id:id_patient_id",
        "input#id_patient_id.textinput.form-control",
        "name:patient_id",
        "//input[contains(@placeholder, 'ID') or contains(@aria-label, '환자') or contains(@aria-label, 'Patient') or contains(@name, 'patient_id')]",
    ])
}

pub fn first_name_field() -> Strategies {
    table(&[
        "id:id_first_name",
        "input#id_first_name.textinput.form-control",
        "//label[contains(text(), '이름')]/following-sibling::input",
        "//label[contains(text(), '이름')]/parent::*/input",
        "//input[@placeholder='이름']",
        "name:first_name",
    ])
}

pub fn last_name_field() -> Strategies {
    table(&[
        "id:id_last_name",
        "input#id_last_name.textinput.form-control",
        "//label[contains(text(), '성')]/following-sibling::input",
        "//label[contains(text(), '성')]/parent::*/input",
        "//input[@placeholder='성']",
        "name:last_name",
    ])
}

pub fn race_select() -> Strategies {
    table(&[
        "id:id_race",
        "select#id_race.select.form-control",
        "//label[contains(text(), '인종')]/following-sibling::select",
        "//label[contains(text(), '인종')]/parent::*/select",
        "name:race",
        "//select[contains(@name, 'race')]",
    ])
}

pub fn race_asian_option() -> Strategies {
    table(&[
        "//option[contains(text(), 'Asian')]",
        "//option[contains(text(), 'asian')]",
        "//option[contains(text(), '아시안')]",
        "//option[contains(text(), '아시아')]",
        "//option[@value='asian']",
        "//option[@value='Asian']",
    ])
}

pub fn gender_select() -> Strategies {
    table(&[
        "id:id_sex",
        "select#id_sex.select.form-control",
        "//label[contains(text(), '성별')]/following-sibling::select",
        "//label[contains(text(), '성별')]/parent::*/select",
        "name:sex",
        "name:gender",
        "//select[contains(@name, 'sex')]",
    ])
}

pub fn gender_option(gender: Gender) -> Strategies {
    let code = gender.code();
    table(&[
        format!("//option[contains(text(), '{}')]", gender.label()),
        format!("//option[@value='{code}']"),
        format!("//option[@value='{}']", code.to_lowercase()),
    ])
}

pub fn birth_date_field() -> Strategies {
    table(&[
        "id:id_birth_date",
        "input#id_birth_date.dateinput.form-control",
        "//label[contains(text(), 'Date of birth')]/following-sibling::input",
        "//label[contains(text(), '생년월일')]/following-sibling::input",
        "//input[@placeholder='yyyy-mm-dd']",
        "//input[@placeholder='YYYY-MM-DD']",
        "name:birth_date",
        "name:date_of_birth",
        "//input[@type='date']",
    ])
}

pub fn agreement_checkbox() -> Strategies {
    table(&[
        "label[for='check_agreement_from_patient']",
        "id:check_agreement_from_patient",
        "name:agreement_from_patient",
        "label.custom-control-label",
        "input[type='checkbox']",
    ])
}

pub fn create_patient_button() -> Strategies {
    table(&[
        "id:new_patient_submit",
        "button#new_patient_submit.btn.btn-webceph-3",
        "button.btn-webceph-3",
        "//button[contains(text(), '만들기')]",
        "//input[@value='만들기']",
        "//button[contains(text(), 'Create')]",
        "button[type='submit']",
    ])
}

pub fn patient_search_input() -> Strategies {
    table(&[
        "id:search",
        "id:patient-search",
        "input[type='search']",
        "input[placeholder*='검색']",
        "input[placeholder*='Search']",
        "input[placeholder*='환자']",
        "input[placeholder*='Patient']",
        ".search-input",
        "//input[contains(@placeholder, '검색') or contains(@placeholder, 'Search')]",
    ])
}

/// The newest entry of the patient list.
pub fn first_patient_row() -> Strategies {
    table(&[
        "table tbody tr:first-child",
        ".patient-list .patient-item:first-child",
        ".patients-table tbody tr:first-child",
        ".patient-card:first-child",
        ".list-group .list-group-item:first-child",
        ".patient-row:first-child",
        "(//tr[contains(@class, 'patient') or contains(@onclick, 'patient')])[1]",
        "(//div[contains(@class, 'patient') and contains(@class, 'item')])[1]",
    ])
}

/// Selectors matching every row of the patient list.
pub fn patient_rows() -> Vec<Selector> {
    [
        "table tbody tr",
        ".patient-list .patient-item",
        ".patients-table tbody tr",
        ".patient-card",
        ".list-group .list-group-item",
        "//tr[contains(@class, 'patient') or contains(@onclick, 'patient')]",
        "//div[contains(@class, 'patient') and contains(@class, 'item')]",
    ]
    .into_iter()
    .map(Selector::from)
    .collect()
}

pub fn new_record_button() -> Strategies {
    table(&[
        "id:new_record_button",
        "button[data-action='new-record']",
        ".btn-new-record",
        "//button[contains(text(), '새 레코드') or contains(text(), 'New Record')]",
        "//button[contains(text(), '레코드 생성') or contains(text(), 'Create Record')]",
        "//button[contains(text(), '+ 레코드') or contains(text(), '+ Record')]",
        "//a[contains(text(), '새 레코드') or contains(text(), 'New Record')]",
        "//a[contains(text(), '레코드 생성') or contains(text(), 'Create Record')]",
        "//button[contains(@title, '레코드')][.//i[contains(@class, 'fa-plus')]]",
        "//button[contains(@title, 'Record')][.//i[contains(@class, 'fa-plus')]]",
    ])
}

pub fn record_date_field() -> Strategies {
    table(&[
        "id:record_date",
        "id:analysis_date",
        "input[type='date']",
        "input[name*='date']",
        "//input[contains(@placeholder, '날짜') or contains(@placeholder, 'Date')]",
    ])
}

pub fn record_title_field() -> Strategies {
    table(&[
        "id:record_title",
        "id:record_name",
        "id:analysis_title",
        "input[name*='title']",
        "input[placeholder*='제목']",
        "input[placeholder*='Title']",
    ])
}

pub fn record_memo_field() -> Strategies {
    table(&[
        "id:record_memo",
        "id:record_notes",
        "textarea[name*='memo']",
        "textarea[name*='notes']",
        "textarea[placeholder*='메모']",
    ])
}

pub fn confirm_record_button() -> Strategies {
    table(&[
        "id:create_record_button",
        "id:confirm_button",
        "//button[contains(text(), '생성') or contains(text(), 'Create')]",
        "//button[contains(text(), '확인') or contains(text(), 'Confirm')]",
        "//button[contains(text(), '저장') or contains(text(), 'Save')]",
        "//input[@type='submit' and contains(@value, '생성')]",
        "//input[@type='submit' and contains(@value, 'Create')]",
        "button[type='submit']",
    ])
}

/// Shown once a record accepts images.
pub fn record_ready() -> Strategies {
    table(&[
        "id:image_upload",
        "id:file_upload",
        "input[type='file']",
        ".upload-area",
        ".file-drop-zone",
        "//div[contains(@class, 'upload') or contains(@class, 'drop')]",
        "//button[contains(text(), '이미지 업로드') or contains(text(), 'Upload Image')]",
    ])
}

pub fn upload_input(kind: &str) -> Strategies {
    table(&[
        format!("//input[@type='file' and contains(@name, '{kind}')]"),
        "id:image_upload".to_string(),
        "id:file_upload".to_string(),
        "input[type='file']".to_string(),
    ])
}

pub fn upload_confirmation() -> Strategies {
    table(&[
        "class:upload-success",
        "class:thumbnail",
        "//img[contains(@src, 'thumb')]",
    ])
}

pub fn analyze_button() -> Strategies {
    table(&[
        "//button[contains(text(), '분석') or contains(text(), 'Analyze') or contains(text(), 'Start')]",
        "//button[contains(text(), '분석 시작') or contains(text(), 'Start Analysis')]",
        "//button[contains(text(), '새 분석') or contains(text(), 'New Analysis')]",
        "//a[contains(text(), '새 분석') or contains(text(), 'New Analysis')]",
        "button[data-action='start-analysis']",
        ".btn-start-analysis",
    ])
}

/// Shown right after an analysis is accepted.
pub fn analysis_started() -> Strategies {
    table(&[
        "class:analysis-progress",
        "class:processing",
        "//div[contains(text(), '분석') and contains(text(), '진행')]",
    ])
}

pub fn completion_indicator() -> Strategies {
    table(&[
        "//button[contains(text(), 'Download') or contains(text(), '다운로드')]",
        "//div[contains(text(), '완료') or contains(text(), 'Complete')]",
    ])
}

pub fn progress_indicator() -> Strategies {
    table(&[
        "//div[contains(text(), '진행') or contains(text(), 'Progress') or contains(text(), 'Processing')]",
    ])
}

pub fn download_button() -> Strategies {
    table(&[
        "//button[contains(text(), 'Download') or contains(text(), '다운로드')]",
        "//a[contains(text(), 'PDF')]",
    ])
}
