#![cfg_attr(not(debug_assertions), windows_subsystem = "windows")]

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use chrono::{NaiveDate, SecondsFormat, Utc};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use tauri::{AppHandle, Manager, State, Window};
use tauri_plugin_clipboard_manager::ClipboardExt;
use tauri_plugin_opener::OpenerExt;

const NAMESPACE: &str = "erp_civi";
const CURRENT_USER_KEY: &str = "currentUser";
const COLLECTIONS: [&str; 11] = [
    "clients",
    "projects",
    "boq_items",
    "running_bills",
    "invoices",
    "vendors",
    "materials",
    "material_stock",
    "equipment",
    "equipment_allocations",
    "daily_reports",
];
const EXPORT_ROW_LIMIT: usize = 50_000;
const GST_RATE: f64 = 0.18;
const DEFAULT_RETENTION_PERCENTAGE: f64 = 10.0;
// Rough profit estimate treats this share of billed work as cost. Placeholder
// carried over from the source data, not a verified business rule.
const ASSUMED_COST_RATIO: f64 = 0.6;

type FormMap = serde_json::Map<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Domain types
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum UserRole {
    Admin,
    Finance,
    ProjectManager,
    SiteEngineer,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Module {
    #[default]
    Dashboard,
    Projects,
    Boq,
    Billing,
    Invoices,
    Clients,
    Vendors,
    Inventory,
    Equipment,
    DailyReports,
    Reports,
}

const ALL_MODULES: [Module; 11] = [
    Module::Dashboard,
    Module::Projects,
    Module::Boq,
    Module::Billing,
    Module::Invoices,
    Module::Clients,
    Module::Vendors,
    Module::Inventory,
    Module::Equipment,
    Module::DailyReports,
    Module::Reports,
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ProjectStatus {
    Planning,
    Ongoing,
    Completed,
    OnHold,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum BillStatus {
    Draft,
    Submitted,
    Approved,
    Paid,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum InvoiceStatus {
    Draft,
    Sent,
    Paid,
    Overdue,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum VendorCategory {
    Labor,
    Material,
    Equipment,
    Subcontractor,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum EquipmentStatus {
    Available,
    InUse,
    Maintenance,
    Retired,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct User {
    id: String,
    name: String,
    email: String,
    role: UserRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    department: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Project {
    id: String,
    name: String,
    client_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    start_date: String,
    end_date: String,
    budget: f64,
    status: ProjectStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    location: Option<String>,
    created_at: String,
    updated_at: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Client {
    id: String,
    name: String,
    email: String,
    phone: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    zip_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    gstin: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    contact_person: Option<String>,
    created_at: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Vendor {
    id: String,
    name: String,
    category: VendorCategory,
    #[serde(skip_serializing_if = "Option::is_none")]
    email: Option<String>,
    phone: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bank_account: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    gstin: Option<String>,
    created_at: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BoqItem {
    id: String,
    project_id: String,
    item_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    quantity: f64,
    unit: String,
    rate: f64,
    total_amount: f64,
    created_at: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BillLine {
    item_id: String,
    quantity: f64,
    rate: f64,
    total: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunningBill {
    id: String,
    project_id: String,
    bill_number: String,
    bill_date: String,
    boq_items: Vec<BillLine>,
    subtotal: f64,
    retention_percentage: f64,
    retention_amount: f64,
    bill_amount: f64,
    status: BillStatus,
    created_at: String,
    updated_at: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Invoice {
    id: String,
    project_id: String,
    invoice_number: String,
    bill_id: String,
    invoice_date: String,
    due_date: String,
    amount: f64,
    tax: f64,
    total_amount: f64,
    status: InvoiceStatus,
    client_id: String,
    created_at: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Material {
    id: String,
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    unit: String,
    category: String,
    reorder_level: f64,
    created_at: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MaterialStock {
    id: String,
    material_id: String,
    current_stock: f64,
    last_updated: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Equipment {
    id: String,
    name: String,
    category: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    serial_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    purchase_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    purchase_value: Option<f64>,
    status: EquipmentStatus,
    created_at: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EquipmentAllocation {
    id: String,
    equipment_id: String,
    project_id: String,
    allocation_date: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    deallocation_date: Option<String>,
    created_at: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DailyReport {
    id: String,
    project_id: String,
    report_date: String,
    site_engineer: String,
    work_description: String,
    quantity_executed: f64,
    unit: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    boq_item_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    weather: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    no_of_workers: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    remarks: Option<String>,
    #[serde(default)]
    photos: Vec<String>,
    created_at: String,
}

// ---------------------------------------------------------------------------
// Collection plumbing
// ---------------------------------------------------------------------------

trait Record: Clone + Serialize + DeserializeOwned {
    const COLLECTION: &'static str;
    const ID_PREFIX: &'static str;
    const TRACKS_UPDATED_AT: bool = false;

    fn id(&self) -> &str;
}

impl Record for Project {
    const COLLECTION: &'static str = "projects";
    const ID_PREFIX: &'static str = "proj";
    const TRACKS_UPDATED_AT: bool = true;

    fn id(&self) -> &str {
        self.id.as_str()
    }
}

impl Record for Client {
    const COLLECTION: &'static str = "clients";
    const ID_PREFIX: &'static str = "client";

    fn id(&self) -> &str {
        self.id.as_str()
    }
}

impl Record for Vendor {
    const COLLECTION: &'static str = "vendors";
    const ID_PREFIX: &'static str = "vendor";

    fn id(&self) -> &str {
        self.id.as_str()
    }
}

impl Record for BoqItem {
    const COLLECTION: &'static str = "boq_items";
    const ID_PREFIX: &'static str = "boq";

    fn id(&self) -> &str {
        self.id.as_str()
    }
}

impl Record for RunningBill {
    const COLLECTION: &'static str = "running_bills";
    const ID_PREFIX: &'static str = "bill";
    const TRACKS_UPDATED_AT: bool = true;

    fn id(&self) -> &str {
        self.id.as_str()
    }
}

impl Record for Invoice {
    const COLLECTION: &'static str = "invoices";
    const ID_PREFIX: &'static str = "inv";

    fn id(&self) -> &str {
        self.id.as_str()
    }
}

impl Record for Material {
    const COLLECTION: &'static str = "materials";
    const ID_PREFIX: &'static str = "mat";

    fn id(&self) -> &str {
        self.id.as_str()
    }
}

impl Record for MaterialStock {
    const COLLECTION: &'static str = "material_stock";
    const ID_PREFIX: &'static str = "stock";

    fn id(&self) -> &str {
        self.id.as_str()
    }
}

impl Record for Equipment {
    const COLLECTION: &'static str = "equipment";
    const ID_PREFIX: &'static str = "equip";

    fn id(&self) -> &str {
        self.id.as_str()
    }
}

impl Record for EquipmentAllocation {
    const COLLECTION: &'static str = "equipment_allocations";
    const ID_PREFIX: &'static str = "alloc";

    fn id(&self) -> &str {
        self.id.as_str()
    }
}

impl Record for DailyReport {
    const COLLECTION: &'static str = "daily_reports";
    const ID_PREFIX: &'static str = "report";

    fn id(&self) -> &str {
        self.id.as_str()
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Default)]
struct SessionState {
    user: Option<User>,
    module: Module,
}

// ---------------------------------------------------------------------------
// Request/response payloads
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct RecordIdRequest {
    id: String,
}

#[derive(Deserialize)]
struct RecordUpdateRequest {
    id: String,
    updates: serde_json::Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectScopeRequest {
    #[serde(default)]
    project_id: Option<String>,
}

#[derive(Deserialize)]
struct LoginRoleRequest {
    role: UserRole,
}

#[derive(Deserialize)]
struct PermissionRequest {
    permission: String,
}

#[derive(Deserialize)]
struct ActionRequest {
    module: String,
    action: String,
}

#[derive(Deserialize)]
struct ModuleRequest {
    module: Module,
}

#[derive(Deserialize)]
struct ClipboardWriteRequest {
    text: String,
}

#[derive(Deserialize)]
struct OpenExternalRequest {
    url: String,
}

#[derive(Deserialize)]
struct SaveCsvRequest {
    filename: String,
    content: String,
}

#[derive(Serialize)]
struct SaveCsvResult {
    ok: bool,
    canceled: bool,
    filename: String,
    path: Option<String>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct CsvCollectionRequest {
    collection: String,
    filename: Option<String>,
}

#[derive(Serialize)]
struct StorageInfoResult {
    ok: bool,
    path_label: String,
}

#[derive(Serialize)]
struct BackupExportResult {
    ok: bool,
    canceled: bool,
    path: Option<String>,
}

#[derive(Serialize)]
struct BackupImportResult {
    ok: bool,
    canceled: bool,
    applied: usize,
}

// ---------------------------------------------------------------------------
// App shell commands
// ---------------------------------------------------------------------------

#[tauri::command]
fn app_version(app: AppHandle) -> String {
    app.package_info().version.to_string()
}

#[tauri::command]
fn platform_name() -> String {
    match std::env::consts::OS {
        "windows" => "win32",
        "macos" => "darwin",
        "android" => "android",
        _ => "linux",
    }
    .to_string()
}

#[tauri::command]
fn storage_info(app: AppHandle) -> Result<StorageInfoResult, String> {
    let root = storage_root_dir(&app)?;
    Ok(StorageInfoResult {
        ok: true,
        path_label: root.to_string_lossy().to_string(),
    })
}

#[tauri::command]
fn window_minimize(window: Window) -> Result<(), String> {
    window.minimize().map_err(|err| err.to_string())
}

#[tauri::command]
fn window_maximize(window: Window) -> Result<(), String> {
    window.maximize().map_err(|err| err.to_string())
}

#[tauri::command]
fn window_unmaximize(window: Window) -> Result<(), String> {
    window.unmaximize().map_err(|err| err.to_string())
}

#[tauri::command]
fn window_toggle_maximize(window: Window) -> Result<(), String> {
    if window.is_maximized().map_err(|err| err.to_string())? {
        window.unmaximize().map_err(|err| err.to_string())
    } else {
        window.maximize().map_err(|err| err.to_string())
    }
}

#[tauri::command]
fn window_is_maximized(window: Window) -> Result<bool, String> {
    window.is_maximized().map_err(|err| err.to_string())
}

#[tauri::command]
fn window_close(window: Window) -> Result<(), String> {
    window.close().map_err(|err| err.to_string())
}

#[tauri::command]
fn clipboard_write(app: AppHandle, payload: ClipboardWriteRequest) -> Result<bool, String> {
    app.clipboard()
        .write_text(payload.text)
        .map_err(|err| err.to_string())?;
    Ok(true)
}

#[tauri::command]
fn open_external(app: AppHandle, payload: OpenExternalRequest) -> Result<bool, String> {
    app.opener()
        .open_url(payload.url, Option::<String>::None)
        .map_err(|err: tauri_plugin_opener::Error| err.to_string())?;
    Ok(true)
}

// ---------------------------------------------------------------------------
// Auth & navigation commands
// ---------------------------------------------------------------------------

#[tauri::command]
fn auth_login_role(
    app: AppHandle,
    state: State<'_, Mutex<SessionState>>,
    payload: LoginRoleRequest,
) -> Result<User, String> {
    let store = app_store(&app)?;
    let mut session = state.lock().map_err(|err| err.to_string())?;
    Ok(session_login(&store, &mut session, payload.role))
}

#[tauri::command]
fn auth_logout(app: AppHandle, state: State<'_, Mutex<SessionState>>) -> Result<bool, String> {
    let store = app_store(&app)?;
    let mut session = state.lock().map_err(|err| err.to_string())?;
    session_logout(&store, &mut session);
    Ok(true)
}

#[tauri::command]
fn auth_current(state: State<'_, Mutex<SessionState>>) -> Result<Option<User>, String> {
    let session = state.lock().map_err(|err| err.to_string())?;
    Ok(session.user.clone())
}

#[tauri::command]
fn auth_has_permission(
    state: State<'_, Mutex<SessionState>>,
    payload: PermissionRequest,
) -> Result<bool, String> {
    let session = state.lock().map_err(|err| err.to_string())?;
    Ok(has_permission(
        session.user.as_ref(),
        payload.permission.as_str(),
    ))
}

#[tauri::command]
fn auth_can_perform(
    state: State<'_, Mutex<SessionState>>,
    payload: ActionRequest,
) -> Result<bool, String> {
    let session = state.lock().map_err(|err| err.to_string())?;
    Ok(can_perform(
        session.user.as_ref(),
        payload.module.as_str(),
        payload.action.as_str(),
    ))
}

#[tauri::command]
fn nav_modules(state: State<'_, Mutex<SessionState>>) -> Result<Vec<Module>, String> {
    let session = state.lock().map_err(|err| err.to_string())?;
    Ok(session
        .user
        .as_ref()
        .map(|user| visible_modules(user.role))
        .unwrap_or_default())
}

#[tauri::command]
fn module_get(state: State<'_, Mutex<SessionState>>) -> Result<Module, String> {
    let session = state.lock().map_err(|err| err.to_string())?;
    Ok(session.module)
}

#[tauri::command]
fn module_set(
    state: State<'_, Mutex<SessionState>>,
    payload: ModuleRequest,
) -> Result<Module, String> {
    let mut session = state.lock().map_err(|err| err.to_string())?;
    session.module = payload.module;
    Ok(session.module)
}

// ---------------------------------------------------------------------------
// Project commands
// ---------------------------------------------------------------------------

#[tauri::command]
fn project_list(app: AppHandle) -> Result<Vec<Project>, String> {
    Ok(collection_all(&app_store(&app)?))
}

#[tauri::command]
fn project_get(app: AppHandle, payload: RecordIdRequest) -> Result<Option<Project>, String> {
    Ok(collection_find(&app_store(&app)?, payload.id.as_str()))
}

#[tauri::command]
fn project_create(app: AppHandle, values: serde_json::Value) -> Result<Project, String> {
    create_project(&app_store(&app)?, &values)
}

#[tauri::command]
fn project_update(app: AppHandle, payload: RecordUpdateRequest) -> Result<Option<Project>, String> {
    update_project(&app_store(&app)?, payload.id.as_str(), &payload.updates)
}

#[tauri::command]
fn project_delete(app: AppHandle, payload: RecordIdRequest) -> Result<bool, String> {
    Ok(collection_remove::<Project>(
        &app_store(&app)?,
        payload.id.as_str(),
    ))
}

// ---------------------------------------------------------------------------
// Client commands
// ---------------------------------------------------------------------------

#[tauri::command]
fn client_list(app: AppHandle) -> Result<Vec<Client>, String> {
    Ok(collection_all(&app_store(&app)?))
}

#[tauri::command]
fn client_create(app: AppHandle, values: serde_json::Value) -> Result<Client, String> {
    create_client(&app_store(&app)?, &values)
}

#[tauri::command]
fn client_update(app: AppHandle, payload: RecordUpdateRequest) -> Result<Option<Client>, String> {
    update_client(&app_store(&app)?, payload.id.as_str(), &payload.updates)
}

#[tauri::command]
fn client_delete(app: AppHandle, payload: RecordIdRequest) -> Result<bool, String> {
    Ok(collection_remove::<Client>(
        &app_store(&app)?,
        payload.id.as_str(),
    ))
}

// ---------------------------------------------------------------------------
// BOQ commands
// ---------------------------------------------------------------------------

#[tauri::command]
fn boq_list(app: AppHandle, payload: ProjectScopeRequest) -> Result<Vec<BoqItem>, String> {
    let rows: Vec<BoqItem> = collection_all(&app_store(&app)?);
    Ok(scope_to_project(rows, payload.project_id.as_deref(), |row| {
        row.project_id.as_str()
    }))
}

#[tauri::command]
fn boq_create(app: AppHandle, values: serde_json::Value) -> Result<BoqItem, String> {
    create_boq_item(&app_store(&app)?, &values)
}

#[tauri::command]
fn boq_update(app: AppHandle, payload: RecordUpdateRequest) -> Result<Option<BoqItem>, String> {
    update_boq_item(&app_store(&app)?, payload.id.as_str(), &payload.updates)
}

#[tauri::command]
fn boq_delete(app: AppHandle, payload: RecordIdRequest) -> Result<bool, String> {
    Ok(collection_remove::<BoqItem>(
        &app_store(&app)?,
        payload.id.as_str(),
    ))
}

// ---------------------------------------------------------------------------
// Billing commands
// ---------------------------------------------------------------------------

#[tauri::command]
fn bill_list(app: AppHandle, payload: ProjectScopeRequest) -> Result<Vec<RunningBill>, String> {
    let rows: Vec<RunningBill> = collection_all(&app_store(&app)?);
    Ok(scope_to_project(rows, payload.project_id.as_deref(), |row| {
        row.project_id.as_str()
    }))
}

#[tauri::command]
fn bill_create(app: AppHandle, values: serde_json::Value) -> Result<RunningBill, String> {
    create_running_bill(&app_store(&app)?, &values)
}

#[tauri::command]
fn bill_update(app: AppHandle, payload: RecordUpdateRequest) -> Result<Option<RunningBill>, String> {
    update_running_bill(&app_store(&app)?, payload.id.as_str(), &payload.updates)
}

#[tauri::command]
fn bill_delete(app: AppHandle, payload: RecordIdRequest) -> Result<bool, String> {
    Ok(collection_remove::<RunningBill>(
        &app_store(&app)?,
        payload.id.as_str(),
    ))
}

// ---------------------------------------------------------------------------
// Invoice commands
// ---------------------------------------------------------------------------

#[tauri::command]
fn invoice_list(app: AppHandle, payload: ProjectScopeRequest) -> Result<Vec<Invoice>, String> {
    let rows: Vec<Invoice> = collection_all(&app_store(&app)?);
    Ok(scope_to_project(rows, payload.project_id.as_deref(), |row| {
        row.project_id.as_str()
    }))
}

#[tauri::command]
fn invoice_create(app: AppHandle, values: serde_json::Value) -> Result<Invoice, String> {
    create_invoice(&app_store(&app)?, &values)
}

#[tauri::command]
fn invoice_update(app: AppHandle, payload: RecordUpdateRequest) -> Result<Option<Invoice>, String> {
    update_invoice(&app_store(&app)?, payload.id.as_str(), &payload.updates)
}

#[tauri::command]
fn invoice_delete(app: AppHandle, payload: RecordIdRequest) -> Result<bool, String> {
    Ok(collection_remove::<Invoice>(
        &app_store(&app)?,
        payload.id.as_str(),
    ))
}

// ---------------------------------------------------------------------------
// Vendor commands
// ---------------------------------------------------------------------------

#[tauri::command]
fn vendor_list(app: AppHandle) -> Result<Vec<Vendor>, String> {
    Ok(collection_all(&app_store(&app)?))
}

#[tauri::command]
fn vendor_create(app: AppHandle, values: serde_json::Value) -> Result<Vendor, String> {
    create_vendor(&app_store(&app)?, &values)
}

#[tauri::command]
fn vendor_update(app: AppHandle, payload: RecordUpdateRequest) -> Result<Option<Vendor>, String> {
    update_vendor(&app_store(&app)?, payload.id.as_str(), &payload.updates)
}

#[tauri::command]
fn vendor_delete(app: AppHandle, payload: RecordIdRequest) -> Result<bool, String> {
    Ok(collection_remove::<Vendor>(
        &app_store(&app)?,
        payload.id.as_str(),
    ))
}

// ---------------------------------------------------------------------------
// Material & stock commands
// ---------------------------------------------------------------------------

#[tauri::command]
fn material_list(app: AppHandle) -> Result<Vec<Material>, String> {
    Ok(collection_all(&app_store(&app)?))
}

#[tauri::command]
fn material_create(app: AppHandle, values: serde_json::Value) -> Result<Material, String> {
    create_material(&app_store(&app)?, &values)
}

#[tauri::command]
fn material_update(
    app: AppHandle,
    payload: RecordUpdateRequest,
) -> Result<Option<Material>, String> {
    update_material(&app_store(&app)?, payload.id.as_str(), &payload.updates)
}

#[tauri::command]
fn material_delete(app: AppHandle, payload: RecordIdRequest) -> Result<bool, String> {
    Ok(collection_remove::<Material>(
        &app_store(&app)?,
        payload.id.as_str(),
    ))
}

#[tauri::command]
fn stock_list(app: AppHandle) -> Result<Vec<MaterialStock>, String> {
    Ok(collection_all(&app_store(&app)?))
}

#[tauri::command]
fn stock_set(app: AppHandle, values: serde_json::Value) -> Result<MaterialStock, String> {
    set_material_stock(&app_store(&app)?, &values)
}

// ---------------------------------------------------------------------------
// Equipment commands
// ---------------------------------------------------------------------------

#[tauri::command]
fn equipment_list(app: AppHandle) -> Result<Vec<Equipment>, String> {
    Ok(collection_all(&app_store(&app)?))
}

#[tauri::command]
fn equipment_create(app: AppHandle, values: serde_json::Value) -> Result<Equipment, String> {
    create_equipment(&app_store(&app)?, &values)
}

#[tauri::command]
fn equipment_update(
    app: AppHandle,
    payload: RecordUpdateRequest,
) -> Result<Option<Equipment>, String> {
    update_equipment(&app_store(&app)?, payload.id.as_str(), &payload.updates)
}

#[tauri::command]
fn equipment_delete(app: AppHandle, payload: RecordIdRequest) -> Result<bool, String> {
    Ok(collection_remove::<Equipment>(
        &app_store(&app)?,
        payload.id.as_str(),
    ))
}

#[tauri::command]
fn allocation_list(
    app: AppHandle,
    payload: ProjectScopeRequest,
) -> Result<Vec<EquipmentAllocation>, String> {
    let rows: Vec<EquipmentAllocation> = collection_all(&app_store(&app)?);
    Ok(scope_to_project(rows, payload.project_id.as_deref(), |row| {
        row.project_id.as_str()
    }))
}

#[tauri::command]
fn equipment_allocate(
    app: AppHandle,
    values: serde_json::Value,
) -> Result<EquipmentAllocation, String> {
    create_allocation(&app_store(&app)?, &values)
}

#[tauri::command]
fn equipment_release(
    app: AppHandle,
    payload: RecordIdRequest,
) -> Result<Option<EquipmentAllocation>, String> {
    Ok(release_allocation(&app_store(&app)?, payload.id.as_str()))
}

// ---------------------------------------------------------------------------
// Daily report commands
// ---------------------------------------------------------------------------

#[tauri::command]
fn daily_report_list(
    app: AppHandle,
    payload: ProjectScopeRequest,
) -> Result<Vec<DailyReport>, String> {
    let rows: Vec<DailyReport> = collection_all(&app_store(&app)?);
    Ok(scope_to_project(rows, payload.project_id.as_deref(), |row| {
        row.project_id.as_str()
    }))
}

#[tauri::command]
fn daily_report_create(app: AppHandle, values: serde_json::Value) -> Result<DailyReport, String> {
    create_daily_report(&app_store(&app)?, &values)
}

#[tauri::command]
fn daily_report_update(
    app: AppHandle,
    payload: RecordUpdateRequest,
) -> Result<Option<DailyReport>, String> {
    update_daily_report(&app_store(&app)?, payload.id.as_str(), &payload.updates)
}

#[tauri::command]
fn daily_report_delete(app: AppHandle, payload: RecordIdRequest) -> Result<bool, String> {
    Ok(collection_remove::<DailyReport>(
        &app_store(&app)?,
        payload.id.as_str(),
    ))
}

// ---------------------------------------------------------------------------
// Dashboard & report commands
// ---------------------------------------------------------------------------

#[tauri::command]
fn dashboard_kpis(app: AppHandle) -> Result<DashboardKpis, String> {
    Ok(dashboard_kpis_value(&app_store(&app)?))
}

#[tauri::command]
fn project_summary_report(app: AppHandle) -> Result<Vec<ProjectSummaryRow>, String> {
    Ok(project_summary_rows(&app_store(&app)?))
}

#[tauri::command]
fn billing_summary_report(app: AppHandle) -> Result<Vec<BillingSummaryRow>, String> {
    Ok(billing_summary_rows(&app_store(&app)?))
}

#[tauri::command]
fn pending_payments_report(app: AppHandle) -> Result<Vec<PendingPaymentRow>, String> {
    Ok(pending_payment_rows(&app_store(&app)?))
}

// ---------------------------------------------------------------------------
// Export & backup commands
// ---------------------------------------------------------------------------

#[tauri::command]
fn save_csv_file(payload: SaveCsvRequest) -> Result<SaveCsvResult, String> {
    save_csv_dialog(payload.filename.as_str(), payload.content.as_str())
}

#[tauri::command]
fn collection_export_csv(
    app: AppHandle,
    payload: CsvCollectionRequest,
) -> Result<SaveCsvResult, String> {
    let collection = payload.collection.as_str();
    if !COLLECTIONS.contains(&collection) {
        return Err(format!("Unknown collection: {collection}."));
    }
    let store = app_store(&app)?;
    let mut rows: Vec<serde_json::Value> = store.get_as(collection).unwrap_or_default();
    if rows.len() > EXPORT_ROW_LIMIT {
        rows.truncate(EXPORT_ROW_LIMIT);
    }
    let columns = collection_columns(rows.as_slice());
    let csv = rows_to_csv(columns.as_slice(), rows.as_slice());
    let filename = payload
        .filename
        .unwrap_or_else(|| format!("{collection}-export.csv"));
    save_csv_dialog(filename.as_str(), csv.as_str())
}

#[tauri::command]
fn backup_export(app: AppHandle) -> Result<BackupExportResult, String> {
    let store = app_store(&app)?;
    let backup = build_backup_value(&store);
    let content = serde_json::to_string_pretty(&backup).map_err(|err| err.to_string())?;
    let path = rfd::FileDialog::new()
        .set_file_name("erpcivil-backup.json")
        .save_file();
    let Some(path) = path else {
        return Ok(BackupExportResult {
            ok: false,
            canceled: true,
            path: None,
        });
    };
    write_text_file(path.clone(), content.as_str())?;
    Ok(BackupExportResult {
        ok: true,
        canceled: false,
        path: Some(path.to_string_lossy().to_string()),
    })
}

#[tauri::command]
fn backup_import(
    app: AppHandle,
    state: State<'_, Mutex<SessionState>>,
) -> Result<BackupImportResult, String> {
    let path = rfd::FileDialog::new()
        .add_filter("ERP Civil Backup", &["json"])
        .pick_file();
    let Some(path) = path else {
        return Ok(BackupImportResult {
            ok: false,
            canceled: true,
            applied: 0,
        });
    };
    let raw = fs::read_to_string(&path).map_err(|err| err.to_string())?;
    let parsed: serde_json::Value =
        serde_json::from_str(raw.as_str()).map_err(|_| "Invalid backup file.".to_string())?;
    let store = app_store(&app)?;
    let applied = apply_backup_value(&store, &parsed)?;
    let mut session = state.lock().map_err(|err| err.to_string())?;
    session.user = store.get_as(CURRENT_USER_KEY);
    Ok(BackupImportResult {
        ok: true,
        canceled: false,
        applied,
    })
}

// ---------------------------------------------------------------------------
// Key-value store
// ---------------------------------------------------------------------------

struct KvStore {
    dir: PathBuf,
}

impl KvStore {
    fn open(root: &Path) -> KvStore {
        KvStore {
            dir: root.join(NAMESPACE),
        }
    }

    fn scoped(&self, key: &str) -> String {
        format!("{NAMESPACE}:{key}")
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    fn get(&self, key: &str) -> Option<serde_json::Value> {
        let path = self.key_path(key);
        if !path.exists() {
            return None;
        }
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(key = %self.scoped(key), error = %err, "store read failed");
                return None;
            }
        };
        match serde_json::from_str(raw.as_str()) {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::warn!(key = %self.scoped(key), error = %err, "store value unreadable");
                None
            }
        }
    }

    fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get(key)?;
        match serde_json::from_value(value) {
            Ok(out) => Some(out),
            Err(err) => {
                tracing::warn!(key = %self.scoped(key), error = %err, "store value has unexpected shape");
                None
            }
        }
    }

    fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) {
        let content = match serde_json::to_string_pretty(value) {
            Ok(content) => content,
            Err(err) => {
                tracing::error!(key = %self.scoped(key), error = %err, "store serialize failed");
                return;
            }
        };
        if let Err(err) = fs::create_dir_all(self.dir.as_path()) {
            tracing::error!(key = %self.scoped(key), error = %err, "store write failed");
            return;
        }
        if let Err(err) = fs::write(self.key_path(key), content) {
            tracing::error!(key = %self.scoped(key), error = %err, "store write failed");
        }
    }

    fn remove(&self, key: &str) {
        let path = self.key_path(key);
        if !path.exists() {
            return;
        }
        if let Err(err) = fs::remove_file(path) {
            tracing::warn!(key = %self.scoped(key), error = %err, "store remove failed");
        }
    }

    /// Removes every key under the namespace; files outside it are untouched.
    fn clear(&self) {
        let entries = match fs::read_dir(self.dir.as_path()) {
            Ok(entries) => entries,
            Err(_) => return,
        };
        for entry in entries.flatten() {
            if let Err(err) = fs::remove_file(entry.path()) {
                tracing::warn!(error = %err, "store clear failed for one key");
            }
        }
    }

    fn keys(&self) -> Vec<String> {
        let entries = match fs::read_dir(self.dir.as_path()) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };
        let mut keys: Vec<String> = entries
            .flatten()
            .filter_map(|entry| {
                let path = entry.path();
                if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                    return None;
                }
                path.file_stem()
                    .and_then(|stem| stem.to_str())
                    .map(|stem| stem.to_string())
            })
            .collect();
        keys.sort();
        keys
    }
}

fn storage_root_dir(app: &AppHandle) -> Result<PathBuf, String> {
    static RESOLVED_ROOT: OnceLock<PathBuf> = OnceLock::new();
    if let Some(root) = RESOLVED_ROOT.get() {
        return Ok(root.clone());
    }
    let base = app.path().app_data_dir().map_err(|err| err.to_string())?;
    let root = base.join("ErpCivil");
    fs::create_dir_all(root.as_path()).map_err(|err| err.to_string())?;
    let _ = RESOLVED_ROOT.set(root.clone());
    Ok(root)
}

fn app_store(app: &AppHandle) -> Result<KvStore, String> {
    Ok(KvStore::open(storage_root_dir(app)?.as_path()))
}

fn write_text_file(path: PathBuf, content: &str) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| err.to_string())?;
    }
    fs::write(path, content).map_err(|err| err.to_string())?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Generic collection CRUD
// ---------------------------------------------------------------------------

fn collection_all<T: Record>(store: &KvStore) -> Vec<T> {
    store.get_as(T::COLLECTION).unwrap_or_default()
}

fn collection_find<T: Record>(store: &KvStore, id: &str) -> Option<T> {
    collection_all::<T>(store)
        .into_iter()
        .find(|record| record.id() == id)
}

fn collection_insert<T: Record>(store: &KvStore, record: T) -> T {
    let mut rows = collection_all::<T>(store);
    rows.push(record.clone());
    store.set(T::COLLECTION, &rows);
    record
}

/// Shallow-merges validated fields over the stored record and rewrites the
/// collection. Unknown id: no write, `None`.
fn collection_update<T: Record>(store: &KvStore, id: &str, updates: FormMap) -> Option<T> {
    let mut rows: Vec<serde_json::Value> = store.get_as(T::COLLECTION).unwrap_or_default();
    let slot = rows
        .iter_mut()
        .find(|row| row.get("id").and_then(|value| value.as_str()) == Some(id))?;
    let obj = slot.as_object_mut()?;
    for (key, value) in updates {
        if value.is_null() {
            obj.remove(key.as_str());
        } else {
            obj.insert(key, value);
        }
    }
    if T::TRACKS_UPDATED_AT {
        obj.insert("updatedAt".to_string(), json!(now_iso()));
    }
    let merged: T = match serde_json::from_value(slot.clone()) {
        Ok(merged) => merged,
        Err(err) => {
            tracing::warn!(collection = T::COLLECTION, id, error = %err, "merge produced an invalid record, dropping update");
            return None;
        }
    };
    store.set(T::COLLECTION, &rows);
    Some(merged)
}

/// Filter-style delete. Reports success even when nothing matched.
fn collection_remove<T: Record>(store: &KvStore, id: &str) -> bool {
    let mut rows: Vec<serde_json::Value> = store.get_as(T::COLLECTION).unwrap_or_default();
    rows.retain(|row| row.get("id").and_then(|value| value.as_str()) != Some(id));
    store.set(T::COLLECTION, &rows);
    true
}

fn new_record_id(prefix: &str) -> String {
    let suffix: String = rand::rng()
        .sample_iter(&rand::distr::Alphanumeric)
        .map(char::from)
        .map(|ch| ch.to_ascii_lowercase())
        .take(9)
        .collect();
    format!("{prefix}_{}_{suffix}", Utc::now().timestamp_millis())
}

fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn now_date() -> String {
    Utc::now().date_naive().to_string()
}

fn scope_to_project<T>(rows: Vec<T>, project_id: Option<&str>, key: impl Fn(&T) -> &str) -> Vec<T> {
    match project_id {
        Some(project_id) => rows
            .into_iter()
            .filter(|row| key(row) == project_id)
            .collect(),
        None => rows,
    }
}

// ---------------------------------------------------------------------------
// Form boundary validation
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
enum FieldKind {
    Text,
    OptText,
    Number,
    OptNumber,
    OptCount,
    ProjectStatus,
    BillStatus,
    InvoiceStatus,
    VendorCategory,
    EquipmentStatus,
}

const PROJECT_UPDATE_FIELDS: &[(&str, FieldKind)] = &[
    ("name", FieldKind::Text),
    ("clientId", FieldKind::Text),
    ("description", FieldKind::OptText),
    ("startDate", FieldKind::Text),
    ("endDate", FieldKind::Text),
    ("budget", FieldKind::Number),
    ("status", FieldKind::ProjectStatus),
    ("location", FieldKind::OptText),
];

const CLIENT_UPDATE_FIELDS: &[(&str, FieldKind)] = &[
    ("name", FieldKind::Text),
    ("email", FieldKind::Text),
    ("phone", FieldKind::Text),
    ("address", FieldKind::OptText),
    ("city", FieldKind::OptText),
    ("state", FieldKind::OptText),
    ("zipCode", FieldKind::OptText),
    ("gstin", FieldKind::OptText),
    ("contactPerson", FieldKind::OptText),
];

const VENDOR_UPDATE_FIELDS: &[(&str, FieldKind)] = &[
    ("name", FieldKind::Text),
    ("category", FieldKind::VendorCategory),
    ("email", FieldKind::OptText),
    ("phone", FieldKind::Text),
    ("address", FieldKind::OptText),
    ("bankAccount", FieldKind::OptText),
    ("gstin", FieldKind::OptText),
];

const BOQ_UPDATE_FIELDS: &[(&str, FieldKind)] = &[
    ("itemName", FieldKind::Text),
    ("description", FieldKind::OptText),
    ("quantity", FieldKind::Number),
    ("unit", FieldKind::Text),
    ("rate", FieldKind::Number),
];

const BILL_UPDATE_FIELDS: &[(&str, FieldKind)] = &[
    ("billNumber", FieldKind::Text),
    ("billDate", FieldKind::Text),
    ("status", FieldKind::BillStatus),
];

const INVOICE_UPDATE_FIELDS: &[(&str, FieldKind)] = &[
    ("invoiceNumber", FieldKind::Text),
    ("dueDate", FieldKind::Text),
    ("status", FieldKind::InvoiceStatus),
];

const MATERIAL_UPDATE_FIELDS: &[(&str, FieldKind)] = &[
    ("name", FieldKind::Text),
    ("description", FieldKind::OptText),
    ("unit", FieldKind::Text),
    ("category", FieldKind::Text),
    ("reorderLevel", FieldKind::Number),
];

const EQUIPMENT_UPDATE_FIELDS: &[(&str, FieldKind)] = &[
    ("name", FieldKind::Text),
    ("category", FieldKind::Text),
    ("serialNumber", FieldKind::OptText),
    ("purchaseDate", FieldKind::OptText),
    ("purchaseValue", FieldKind::OptNumber),
    ("status", FieldKind::EquipmentStatus),
];

const DAILY_REPORT_UPDATE_FIELDS: &[(&str, FieldKind)] = &[
    ("reportDate", FieldKind::Text),
    ("siteEngineer", FieldKind::Text),
    ("workDescription", FieldKind::Text),
    ("quantityExecuted", FieldKind::Number),
    ("unit", FieldKind::Text),
    ("boqItemId", FieldKind::OptText),
    ("weather", FieldKind::OptText),
    ("noOfWorkers", FieldKind::OptCount),
    ("remarks", FieldKind::OptText),
];

fn form_object(values: &serde_json::Value) -> Result<&FormMap, String> {
    values
        .as_object()
        .ok_or_else(|| "Expected a form object.".to_string())
}

fn clamp_string(value: &str, max_len: usize, trim: bool) -> String {
    let mut out = if trim {
        value.trim().to_string()
    } else {
        value.to_string()
    };
    out = out
        .chars()
        .filter(|ch| {
            let code = *ch as u32;
            code >= 32 && code != 127
        })
        .collect();
    if out.chars().count() > max_len {
        out = out.chars().take(max_len).collect();
    }
    out
}

fn require_text(raw: &serde_json::Value, key: &str) -> Result<String, String> {
    let Some(text) = raw.as_str() else {
        return Err(format!("Invalid value for field: {key}."));
    };
    let clean = clamp_string(text, 512, true);
    if clean.is_empty() {
        return Err(format!("Missing required field: {key}."));
    }
    Ok(clean)
}

fn optional_text(raw: &serde_json::Value, key: &str) -> Result<Option<String>, String> {
    if raw.is_null() {
        return Ok(None);
    }
    let Some(text) = raw.as_str() else {
        return Err(format!("Invalid value for field: {key}."));
    };
    let clean = clamp_string(text, 512, true);
    if clean.is_empty() {
        Ok(None)
    } else {
        Ok(Some(clean))
    }
}

fn require_number(raw: &serde_json::Value, key: &str) -> Result<f64, String> {
    let parsed = match raw {
        serde_json::Value::Number(number) => number.as_f64(),
        serde_json::Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    };
    match parsed {
        Some(value) if value.is_finite() => Ok(value),
        _ => Err(format!("Invalid number for field: {key}.")),
    }
}

fn optional_number(raw: &serde_json::Value, key: &str) -> Result<Option<f64>, String> {
    match raw {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::String(text) if text.trim().is_empty() => Ok(None),
        _ => require_number(raw, key).map(Some),
    }
}

fn require_count(raw: &serde_json::Value, key: &str) -> Result<u32, String> {
    let value = require_number(raw, key)?;
    if value < 0.0 || value.fract() != 0.0 || value > f64::from(u32::MAX) {
        return Err(format!("Invalid number for field: {key}."));
    }
    Ok(value as u32)
}

fn parse_enum_value<T: DeserializeOwned>(raw: &serde_json::Value, key: &str) -> Result<T, String> {
    serde_json::from_value(raw.clone()).map_err(|_| format!("Invalid value for field: {key}."))
}

fn field_str(form: &FormMap, key: &str) -> Result<String, String> {
    let Some(raw) = form.get(key) else {
        return Err(format!("Missing required field: {key}."));
    };
    require_text(raw, key)
}

fn field_str_opt(form: &FormMap, key: &str) -> Result<Option<String>, String> {
    match form.get(key) {
        Some(raw) => optional_text(raw, key),
        None => Ok(None),
    }
}

fn field_f64(form: &FormMap, key: &str) -> Result<f64, String> {
    let Some(raw) = form.get(key) else {
        return Err(format!("Missing required field: {key}."));
    };
    require_number(raw, key)
}

fn field_f64_opt(form: &FormMap, key: &str) -> Result<Option<f64>, String> {
    match form.get(key) {
        Some(raw) => optional_number(raw, key),
        None => Ok(None),
    }
}

fn field_f64_or(form: &FormMap, key: &str, default: f64) -> Result<f64, String> {
    Ok(field_f64_opt(form, key)?.unwrap_or(default))
}

fn field_count_opt(form: &FormMap, key: &str) -> Result<Option<u32>, String> {
    match form.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(text)) if text.trim().is_empty() => Ok(None),
        Some(raw) => require_count(raw, key).map(Some),
    }
}

fn field_enum_or<T: DeserializeOwned>(form: &FormMap, key: &str, default: T) -> Result<T, String> {
    match form.get(key) {
        None | Some(serde_json::Value::Null) => Ok(default),
        Some(serde_json::Value::String(text)) if text.trim().is_empty() => Ok(default),
        Some(raw) => parse_enum_value(raw, key),
    }
}

fn field_enum<T: DeserializeOwned>(form: &FormMap, key: &str) -> Result<T, String> {
    let Some(raw) = form.get(key) else {
        return Err(format!("Missing required field: {key}."));
    };
    parse_enum_value(raw, key)
}

/// Daily-report photos arrive as base64 payloads (optionally as data URLs);
/// each entry must decode or the whole submission is rejected.
fn field_photos(form: &FormMap, key: &str) -> Result<Vec<String>, String> {
    let Some(raw) = form.get(key) else {
        return Ok(Vec::new());
    };
    if raw.is_null() {
        return Ok(Vec::new());
    }
    let Some(items) = raw.as_array() else {
        return Err(format!("Invalid value for field: {key}."));
    };
    let mut photos = Vec::with_capacity(items.len());
    for entry in items {
        let Some(text) = entry.as_str() else {
            return Err(format!("Invalid value for field: {key}."));
        };
        let encoded = text.rsplit("base64,").next().unwrap_or(text);
        if B64.decode(encoded.trim()).is_err() {
            return Err(format!("Invalid photo data in field: {key}."));
        }
        photos.push(text.to_string());
    }
    Ok(photos)
}

fn coerce_field(
    raw: &serde_json::Value,
    key: &str,
    kind: FieldKind,
) -> Result<serde_json::Value, String> {
    match kind {
        FieldKind::Text => Ok(json!(require_text(raw, key)?)),
        FieldKind::OptText => Ok(optional_text(raw, key)?
            .map(|text| json!(text))
            .unwrap_or(serde_json::Value::Null)),
        FieldKind::Number => Ok(json!(require_number(raw, key)?)),
        FieldKind::OptNumber => Ok(optional_number(raw, key)?
            .map(|value| json!(value))
            .unwrap_or(serde_json::Value::Null)),
        FieldKind::OptCount => match raw {
            serde_json::Value::Null => Ok(serde_json::Value::Null),
            serde_json::Value::String(text) if text.trim().is_empty() => {
                Ok(serde_json::Value::Null)
            }
            _ => Ok(json!(require_count(raw, key)?)),
        },
        FieldKind::ProjectStatus => {
            let status: ProjectStatus = parse_enum_value(raw, key)?;
            Ok(json!(status))
        }
        FieldKind::BillStatus => {
            let status: BillStatus = parse_enum_value(raw, key)?;
            Ok(json!(status))
        }
        FieldKind::InvoiceStatus => {
            let status: InvoiceStatus = parse_enum_value(raw, key)?;
            Ok(json!(status))
        }
        FieldKind::VendorCategory => {
            let category: VendorCategory = parse_enum_value(raw, key)?;
            Ok(json!(category))
        }
        FieldKind::EquipmentStatus => {
            let status: EquipmentStatus = parse_enum_value(raw, key)?;
            Ok(json!(status))
        }
    }
}

/// Coerces the submitted partial into a whitelisted update map. Fields outside
/// the whitelist (including `id` and `createdAt`) never merge.
fn collect_updates(
    values: &serde_json::Value,
    fields: &[(&str, FieldKind)],
) -> Result<FormMap, String> {
    let form = form_object(values)?;
    let mut updates = FormMap::new();
    for (key, kind) in fields {
        let Some(raw) = form.get(*key) else {
            continue;
        };
        updates.insert((*key).to_string(), coerce_field(raw, key, *kind)?);
    }
    Ok(updates)
}

// ---------------------------------------------------------------------------
// Entity services
// ---------------------------------------------------------------------------

fn create_project(store: &KvStore, values: &serde_json::Value) -> Result<Project, String> {
    let form = form_object(values)?;
    let now = now_iso();
    let project = Project {
        id: new_record_id(Project::ID_PREFIX),
        name: field_str(form, "name")?,
        client_id: field_str(form, "clientId")?,
        description: field_str_opt(form, "description")?,
        start_date: field_str(form, "startDate")?,
        end_date: field_str(form, "endDate")?,
        budget: field_f64(form, "budget")?,
        status: field_enum_or(form, "status", ProjectStatus::Planning)?,
        location: field_str_opt(form, "location")?,
        created_at: now.clone(),
        updated_at: now,
    };
    Ok(collection_insert(store, project))
}

fn update_project(
    store: &KvStore,
    id: &str,
    values: &serde_json::Value,
) -> Result<Option<Project>, String> {
    let updates = collect_updates(values, PROJECT_UPDATE_FIELDS)?;
    Ok(collection_update(store, id, updates))
}

fn create_client(store: &KvStore, values: &serde_json::Value) -> Result<Client, String> {
    let form = form_object(values)?;
    let client = Client {
        id: new_record_id(Client::ID_PREFIX),
        name: field_str(form, "name")?,
        email: field_str(form, "email")?,
        phone: field_str(form, "phone")?,
        address: field_str_opt(form, "address")?,
        city: field_str_opt(form, "city")?,
        state: field_str_opt(form, "state")?,
        zip_code: field_str_opt(form, "zipCode")?,
        gstin: field_str_opt(form, "gstin")?,
        contact_person: field_str_opt(form, "contactPerson")?,
        created_at: now_iso(),
    };
    Ok(collection_insert(store, client))
}

fn update_client(
    store: &KvStore,
    id: &str,
    values: &serde_json::Value,
) -> Result<Option<Client>, String> {
    let updates = collect_updates(values, CLIENT_UPDATE_FIELDS)?;
    Ok(collection_update(store, id, updates))
}

fn create_vendor(store: &KvStore, values: &serde_json::Value) -> Result<Vendor, String> {
    let form = form_object(values)?;
    let vendor = Vendor {
        id: new_record_id(Vendor::ID_PREFIX),
        name: field_str(form, "name")?,
        category: field_enum(form, "category")?,
        email: field_str_opt(form, "email")?,
        phone: field_str(form, "phone")?,
        address: field_str_opt(form, "address")?,
        bank_account: field_str_opt(form, "bankAccount")?,
        gstin: field_str_opt(form, "gstin")?,
        created_at: now_iso(),
    };
    Ok(collection_insert(store, vendor))
}

fn update_vendor(
    store: &KvStore,
    id: &str,
    values: &serde_json::Value,
) -> Result<Option<Vendor>, String> {
    let updates = collect_updates(values, VENDOR_UPDATE_FIELDS)?;
    Ok(collection_update(store, id, updates))
}

fn create_boq_item(store: &KvStore, values: &serde_json::Value) -> Result<BoqItem, String> {
    let form = form_object(values)?;
    let quantity = field_f64(form, "quantity")?;
    let rate = field_f64(form, "rate")?;
    let item = BoqItem {
        id: new_record_id(BoqItem::ID_PREFIX),
        project_id: field_str(form, "projectId")?,
        item_name: field_str(form, "itemName")?,
        description: field_str_opt(form, "description")?,
        quantity,
        unit: field_str(form, "unit")?,
        rate,
        total_amount: quantity * rate,
        created_at: now_iso(),
    };
    Ok(collection_insert(store, item))
}

fn update_boq_item(
    store: &KvStore,
    id: &str,
    values: &serde_json::Value,
) -> Result<Option<BoqItem>, String> {
    let mut updates = collect_updates(values, BOQ_UPDATE_FIELDS)?;
    if updates.contains_key("quantity") || updates.contains_key("rate") {
        let Some(current) = collection_find::<BoqItem>(store, id) else {
            return Ok(None);
        };
        let quantity = updates
            .get("quantity")
            .and_then(|value| value.as_f64())
            .unwrap_or(current.quantity);
        let rate = updates
            .get("rate")
            .and_then(|value| value.as_f64())
            .unwrap_or(current.rate);
        updates.insert("totalAmount".to_string(), json!(quantity * rate));
    }
    Ok(collection_update(store, id, updates))
}

fn bill_lines_from(form: &FormMap) -> Result<Vec<BillLine>, String> {
    let Some(raw) = form.get("boqItems") else {
        return Ok(Vec::new());
    };
    if raw.is_null() {
        return Ok(Vec::new());
    }
    let Some(items) = raw.as_array() else {
        return Err("Invalid value for field: boqItems.".to_string());
    };
    let mut lines = Vec::with_capacity(items.len());
    for entry in items {
        let Some(line) = entry.as_object() else {
            return Err("Invalid value for field: boqItems.".to_string());
        };
        let quantity = field_f64(line, "quantity")?;
        let rate = field_f64(line, "rate")?;
        lines.push(BillLine {
            item_id: field_str(line, "itemId")?,
            quantity,
            rate,
            total: quantity * rate,
        });
    }
    Ok(lines)
}

fn create_running_bill(store: &KvStore, values: &serde_json::Value) -> Result<RunningBill, String> {
    let form = form_object(values)?;
    let bill_amount = field_f64(form, "billAmount")?;
    let retention_percentage =
        field_f64_or(form, "retentionPercentage", DEFAULT_RETENTION_PERCENTAGE)?;
    let retention_amount = bill_amount * (retention_percentage / 100.0);
    let now = now_iso();
    let bill = RunningBill {
        id: new_record_id(RunningBill::ID_PREFIX),
        project_id: field_str(form, "projectId")?,
        bill_number: field_str(form, "billNumber")?,
        bill_date: field_str(form, "billDate")?,
        boq_items: bill_lines_from(form)?,
        subtotal: bill_amount + retention_amount,
        retention_percentage,
        retention_amount,
        bill_amount,
        status: field_enum_or(form, "status", BillStatus::Draft)?,
        created_at: now.clone(),
        updated_at: now,
    };
    Ok(collection_insert(store, bill))
}

fn update_running_bill(
    store: &KvStore,
    id: &str,
    values: &serde_json::Value,
) -> Result<Option<RunningBill>, String> {
    let updates = collect_updates(values, BILL_UPDATE_FIELDS)?;
    Ok(collection_update(store, id, updates))
}

fn create_invoice(store: &KvStore, values: &serde_json::Value) -> Result<Invoice, String> {
    let form = form_object(values)?;
    let amount = field_f64(form, "amount")?;
    // 18% GST
    let tax = amount * GST_RATE;
    let invoice = Invoice {
        id: new_record_id(Invoice::ID_PREFIX),
        project_id: field_str(form, "projectId")?,
        invoice_number: field_str(form, "invoiceNumber")?,
        bill_id: field_str(form, "billId")?,
        invoice_date: now_date(),
        due_date: field_str(form, "dueDate")?,
        amount,
        tax,
        total_amount: amount + tax,
        status: field_enum_or(form, "status", InvoiceStatus::Draft)?,
        client_id: field_str(form, "clientId")?,
        created_at: now_iso(),
    };
    Ok(collection_insert(store, invoice))
}

fn update_invoice(
    store: &KvStore,
    id: &str,
    values: &serde_json::Value,
) -> Result<Option<Invoice>, String> {
    let updates = collect_updates(values, INVOICE_UPDATE_FIELDS)?;
    Ok(collection_update(store, id, updates))
}

fn create_material(store: &KvStore, values: &serde_json::Value) -> Result<Material, String> {
    let form = form_object(values)?;
    let material = Material {
        id: new_record_id(Material::ID_PREFIX),
        name: field_str(form, "name")?,
        description: field_str_opt(form, "description")?,
        unit: field_str(form, "unit")?,
        category: field_str(form, "category")?,
        reorder_level: field_f64(form, "reorderLevel")?,
        created_at: now_iso(),
    };
    let material = collection_insert(store, material);
    // New materials start with an empty stock row keyed off the material id.
    let stock = MaterialStock {
        id: format!("stock_{}", material.id),
        material_id: material.id.clone(),
        current_stock: 0.0,
        last_updated: now_iso(),
    };
    collection_insert(store, stock);
    Ok(material)
}

fn update_material(
    store: &KvStore,
    id: &str,
    values: &serde_json::Value,
) -> Result<Option<Material>, String> {
    let updates = collect_updates(values, MATERIAL_UPDATE_FIELDS)?;
    Ok(collection_update(store, id, updates))
}

fn set_material_stock(
    store: &KvStore,
    values: &serde_json::Value,
) -> Result<MaterialStock, String> {
    let form = form_object(values)?;
    let material_id = field_str(form, "materialId")?;
    let current_stock = field_f64(form, "currentStock")?;
    let existing = collection_all::<MaterialStock>(store)
        .into_iter()
        .find(|stock| stock.material_id == material_id);
    match existing {
        Some(stock) => {
            let mut updates = FormMap::new();
            updates.insert("currentStock".to_string(), json!(current_stock));
            updates.insert("lastUpdated".to_string(), json!(now_iso()));
            collection_update(store, stock.id.as_str(), updates)
                .ok_or_else(|| "Stock row disappeared during update.".to_string())
        }
        None => Ok(collection_insert(
            store,
            MaterialStock {
                id: format!("stock_{material_id}"),
                material_id,
                current_stock,
                last_updated: now_iso(),
            },
        )),
    }
}

fn create_equipment(store: &KvStore, values: &serde_json::Value) -> Result<Equipment, String> {
    let form = form_object(values)?;
    let equipment = Equipment {
        id: new_record_id(Equipment::ID_PREFIX),
        name: field_str(form, "name")?,
        category: field_str(form, "category")?,
        serial_number: field_str_opt(form, "serialNumber")?,
        purchase_date: field_str_opt(form, "purchaseDate")?,
        purchase_value: field_f64_opt(form, "purchaseValue")?,
        status: field_enum_or(form, "status", EquipmentStatus::Available)?,
        created_at: now_iso(),
    };
    Ok(collection_insert(store, equipment))
}

fn update_equipment(
    store: &KvStore,
    id: &str,
    values: &serde_json::Value,
) -> Result<Option<Equipment>, String> {
    let updates = collect_updates(values, EQUIPMENT_UPDATE_FIELDS)?;
    Ok(collection_update(store, id, updates))
}

fn create_allocation(
    store: &KvStore,
    values: &serde_json::Value,
) -> Result<EquipmentAllocation, String> {
    let form = form_object(values)?;
    let allocation = EquipmentAllocation {
        id: new_record_id(EquipmentAllocation::ID_PREFIX),
        equipment_id: field_str(form, "equipmentId")?,
        project_id: field_str(form, "projectId")?,
        allocation_date: field_str_opt(form, "allocationDate")?.unwrap_or_else(now_date),
        deallocation_date: None,
        created_at: now_iso(),
    };
    let mut status_update = FormMap::new();
    status_update.insert("status".to_string(), json!(EquipmentStatus::InUse));
    let _ = collection_update::<Equipment>(store, allocation.equipment_id.as_str(), status_update);
    Ok(collection_insert(store, allocation))
}

fn release_allocation(store: &KvStore, id: &str) -> Option<EquipmentAllocation> {
    let allocation = collection_find::<EquipmentAllocation>(store, id)?;
    let mut updates = FormMap::new();
    updates.insert("deallocationDate".to_string(), json!(now_date()));
    let released = collection_update::<EquipmentAllocation>(store, id, updates)?;
    let mut status_update = FormMap::new();
    status_update.insert("status".to_string(), json!(EquipmentStatus::Available));
    let _ = collection_update::<Equipment>(store, allocation.equipment_id.as_str(), status_update);
    Some(released)
}

fn create_daily_report(store: &KvStore, values: &serde_json::Value) -> Result<DailyReport, String> {
    let form = form_object(values)?;
    let report = DailyReport {
        id: new_record_id(DailyReport::ID_PREFIX),
        project_id: field_str(form, "projectId")?,
        report_date: field_str_opt(form, "reportDate")?.unwrap_or_else(now_date),
        site_engineer: field_str(form, "siteEngineer")?,
        work_description: field_str(form, "workDescription")?,
        quantity_executed: field_f64(form, "quantityExecuted")?,
        unit: field_str(form, "unit")?,
        boq_item_id: field_str_opt(form, "boqItemId")?,
        weather: field_str_opt(form, "weather")?,
        no_of_workers: field_count_opt(form, "noOfWorkers")?,
        remarks: field_str_opt(form, "remarks")?,
        photos: field_photos(form, "photos")?,
        created_at: now_iso(),
    };
    Ok(collection_insert(store, report))
}

fn update_daily_report(
    store: &KvStore,
    id: &str,
    values: &serde_json::Value,
) -> Result<Option<DailyReport>, String> {
    let updates = collect_updates(values, DAILY_REPORT_UPDATE_FIELDS)?;
    Ok(collection_update(store, id, updates))
}

// ---------------------------------------------------------------------------
// Roles & permissions
// ---------------------------------------------------------------------------

fn role_permissions(role: UserRole) -> &'static [&'static str] {
    match role {
        UserRole::Admin => &["view_all", "create", "edit", "delete", "approve", "financial"],
        UserRole::Finance => &[
            "view_financial",
            "create_invoice",
            "approve_payment",
            "billing",
        ],
        UserRole::ProjectManager => &[
            "view_projects",
            "create_project",
            "edit_project",
            "manage_boq",
            "daily_reports",
        ],
        UserRole::SiteEngineer => &["view_project", "submit_daily_report", "view_expenses"],
    }
}

fn has_permission(user: Option<&User>, permission: &str) -> bool {
    let Some(user) = user else {
        return false;
    };
    role_permissions(user.role).contains(&permission)
}

fn can_perform(user: Option<&User>, module: &str, action: &str) -> bool {
    let Some(user) = user else {
        return false;
    };
    let permissions = role_permissions(user.role);
    if permissions.contains(&"view_all") {
        return true;
    }
    match action {
        "view" => {
            let scoped = format!("view_{module}");
            permissions.iter().any(|permission| *permission == scoped)
        }
        "create" | "edit" | "delete" | "approve" => permissions.contains(&action),
        _ => false,
    }
}

fn module_roles(module: Module) -> &'static [UserRole] {
    match module {
        Module::Dashboard => &[
            UserRole::Admin,
            UserRole::Finance,
            UserRole::ProjectManager,
            UserRole::SiteEngineer,
        ],
        Module::Projects | Module::Boq | Module::Vendors | Module::Inventory | Module::Equipment => {
            &[UserRole::Admin, UserRole::ProjectManager]
        }
        Module::Billing | Module::Clients | Module::Reports => &[
            UserRole::Admin,
            UserRole::Finance,
            UserRole::ProjectManager,
        ],
        Module::Invoices => &[UserRole::Admin, UserRole::Finance],
        Module::DailyReports => &[
            UserRole::Admin,
            UserRole::ProjectManager,
            UserRole::SiteEngineer,
        ],
    }
}

fn visible_modules(role: UserRole) -> Vec<Module> {
    ALL_MODULES
        .into_iter()
        .filter(|module| module_roles(*module).contains(&role))
        .collect()
}

fn default_user(role: UserRole) -> User {
    match role {
        UserRole::Admin => User {
            id: "admin_1".to_string(),
            name: "Admin User".to_string(),
            email: "admin@erpcivi.com".to_string(),
            role: UserRole::Admin,
            phone: Some("+91 9876543210".to_string()),
            department: Some("Administration".to_string()),
        },
        UserRole::Finance => User {
            id: "finance_1".to_string(),
            name: "Finance Manager".to_string(),
            email: "finance@erpcivi.com".to_string(),
            role: UserRole::Finance,
            phone: Some("+91 9876543211".to_string()),
            department: Some("Finance".to_string()),
        },
        UserRole::ProjectManager => User {
            id: "pm_1".to_string(),
            name: "Project Manager".to_string(),
            email: "pm@erpcivi.com".to_string(),
            role: UserRole::ProjectManager,
            phone: Some("+91 9876543212".to_string()),
            department: Some("Project Management".to_string()),
        },
        UserRole::SiteEngineer => User {
            id: "se_1".to_string(),
            name: "Site Engineer".to_string(),
            email: "engineer@erpcivi.com".to_string(),
            role: UserRole::SiteEngineer,
            phone: Some("+91 9876543213".to_string()),
            department: Some("Site Operations".to_string()),
        },
    }
}

/// Any role can log in; there is no credential check by design of the source
/// system. The selected demo user is persisted so the session survives an app
/// restart.
fn session_login(store: &KvStore, session: &mut SessionState, role: UserRole) -> User {
    let user = default_user(role);
    store.set(CURRENT_USER_KEY, &user);
    session.user = Some(user.clone());
    user
}

fn session_logout(store: &KvStore, session: &mut SessionState) {
    store.remove(CURRENT_USER_KEY);
    session.user = None;
}

// ---------------------------------------------------------------------------
// Dashboard & reports
// ---------------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DashboardKpis {
    total_projects: usize,
    ongoing_projects: usize,
    completed_projects: usize,
    total_budget: f64,
    total_billed: f64,
    pending_payments: f64,
    paid_amount: f64,
    profit_estimate: f64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProjectSummaryRow {
    project_name: String,
    budget: f64,
    billed: f64,
    invoiced: f64,
    paid: f64,
    pending: f64,
    profit_margin: f64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BillingSummaryRow {
    status: BillStatus,
    count: usize,
    amount: f64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PendingPaymentRow {
    invoice_number: String,
    client_name: String,
    due_date: String,
    amount: f64,
    status: InvoiceStatus,
    days_overdue: i64,
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn dashboard_kpis_value(store: &KvStore) -> DashboardKpis {
    let projects: Vec<Project> = collection_all(store);
    let bills: Vec<RunningBill> = collection_all(store);
    let invoices: Vec<Invoice> = collection_all(store);
    let total_billed: f64 = bills.iter().map(|bill| bill.bill_amount).sum();
    let paid_amount: f64 = invoices
        .iter()
        .filter(|invoice| invoice.status == InvoiceStatus::Paid)
        .map(|invoice| invoice.total_amount)
        .sum();
    let pending_payments: f64 = invoices
        .iter()
        .filter(|invoice| invoice.status != InvoiceStatus::Paid)
        .map(|invoice| invoice.total_amount)
        .sum();
    let profit_estimate = (paid_amount - total_billed * ASSUMED_COST_RATIO).max(0.0);
    DashboardKpis {
        total_projects: projects.len(),
        ongoing_projects: projects
            .iter()
            .filter(|project| project.status == ProjectStatus::Ongoing)
            .count(),
        completed_projects: projects
            .iter()
            .filter(|project| project.status == ProjectStatus::Completed)
            .count(),
        total_budget: projects.iter().map(|project| project.budget).sum(),
        total_billed,
        pending_payments,
        paid_amount,
        profit_estimate,
    }
}

fn project_summary_rows(store: &KvStore) -> Vec<ProjectSummaryRow> {
    let projects: Vec<Project> = collection_all(store);
    let bills: Vec<RunningBill> = collection_all(store);
    let invoices: Vec<Invoice> = collection_all(store);
    projects
        .into_iter()
        .map(|project| {
            let billed: f64 = bills
                .iter()
                .filter(|bill| bill.project_id == project.id)
                .map(|bill| bill.bill_amount)
                .sum();
            let project_invoices: Vec<&Invoice> = invoices
                .iter()
                .filter(|invoice| invoice.project_id == project.id)
                .collect();
            let invoiced: f64 = project_invoices
                .iter()
                .map(|invoice| invoice.total_amount)
                .sum();
            let paid: f64 = project_invoices
                .iter()
                .filter(|invoice| invoice.status == InvoiceStatus::Paid)
                .map(|invoice| invoice.total_amount)
                .sum();
            let profit_margin = if project.budget > 0.0 {
                round2((project.budget - billed) / project.budget * 100.0)
            } else {
                0.0
            };
            ProjectSummaryRow {
                project_name: project.name,
                budget: project.budget,
                billed,
                invoiced,
                paid,
                pending: invoiced - paid,
                profit_margin,
            }
        })
        .collect()
}

fn billing_summary_rows(store: &KvStore) -> Vec<BillingSummaryRow> {
    const STATUSES: [BillStatus; 4] = [
        BillStatus::Draft,
        BillStatus::Submitted,
        BillStatus::Approved,
        BillStatus::Paid,
    ];
    let bills: Vec<RunningBill> = collection_all(store);
    STATUSES
        .into_iter()
        .map(|status| BillingSummaryRow {
            status,
            count: bills.iter().filter(|bill| bill.status == status).count(),
            amount: bills
                .iter()
                .filter(|bill| bill.status == status)
                .map(|bill| bill.bill_amount)
                .sum(),
        })
        .collect()
}

fn days_since(date: &str) -> i64 {
    match NaiveDate::parse_from_str(date, "%Y-%m-%d") {
        Ok(due) => (Utc::now().date_naive() - due).num_days().max(0),
        Err(_) => 0,
    }
}

fn pending_payment_rows(store: &KvStore) -> Vec<PendingPaymentRow> {
    let invoices: Vec<Invoice> = collection_all(store);
    let clients: Vec<Client> = collection_all(store);
    invoices
        .into_iter()
        .filter(|invoice| invoice.status != InvoiceStatus::Paid)
        .map(|invoice| {
            let client_name = clients
                .iter()
                .find(|client| client.id == invoice.client_id)
                .map(|client| client.name.clone())
                .unwrap_or_else(|| "Unknown".to_string());
            let days_overdue = if invoice.status == InvoiceStatus::Overdue {
                days_since(invoice.due_date.as_str())
            } else {
                0
            };
            PendingPaymentRow {
                invoice_number: invoice.invoice_number,
                client_name,
                due_date: invoice.due_date,
                amount: invoice.total_amount,
                status: invoice.status,
                days_overdue,
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// CSV export
// ---------------------------------------------------------------------------

fn sanitize_filename(value: &str) -> String {
    let mut out = String::new();
    for ch in value.chars() {
        if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.' {
            out.push(ch);
        } else {
            out.push('_');
        }
    }
    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() {
        "erpcivil-export.csv".to_string()
    } else {
        trimmed.to_string()
    }
}

fn sanitize_export_filename(value: &str) -> String {
    let trimmed = clamp_string(value, 255, true);
    let safe = sanitize_filename(trimmed.as_str());
    if safe.to_lowercase().ends_with(".csv") {
        safe
    } else {
        format!("{safe}.csv")
    }
}

fn should_neutralize_csv(value: &str) -> bool {
    let trimmed = value.trim_start();
    if trimmed.is_empty() || trimmed.starts_with('\'') {
        return false;
    }
    matches!(
        trimmed.chars().next(),
        Some('=') | Some('+') | Some('-') | Some('@')
    )
}

fn neutralize_csv_formula(value: &str) -> String {
    if should_neutralize_csv(value) {
        format!("'{value}")
    } else {
        value.to_string()
    }
}

fn csv_escape(value: &str) -> String {
    let safe = neutralize_csv_formula(value);
    if safe.contains(',') || safe.contains('"') || safe.contains('\n') || safe.contains('\r') {
        format!("\"{}\"", safe.replace('"', "\"\""))
    } else {
        safe
    }
}

fn cell_display_string(value: Option<&serde_json::Value>) -> String {
    match value {
        Some(serde_json::Value::Null) | None => String::new(),
        Some(serde_json::Value::String(text)) => text.clone(),
        Some(serde_json::Value::Number(number)) => number.to_string(),
        Some(serde_json::Value::Bool(boolean)) => boolean.to_string(),
        Some(other) => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Ordered union of keys across every row; optional fields are skipped when
/// absent, so the first row alone is not enough.
fn collection_columns(rows: &[serde_json::Value]) -> Vec<String> {
    let mut columns: Vec<String> = Vec::new();
    for row in rows {
        let Some(obj) = row.as_object() else {
            continue;
        };
        for key in obj.keys() {
            if !columns.iter().any(|existing| existing == key) {
                columns.push(key.clone());
            }
        }
    }
    columns
}

fn rows_to_csv(columns: &[String], rows: &[serde_json::Value]) -> String {
    let mut lines: Vec<String> = Vec::new();
    if !columns.is_empty() {
        lines.push(
            columns
                .iter()
                .map(|col| csv_escape(col.as_str()))
                .collect::<Vec<_>>()
                .join(","),
        );
    }
    for row in rows {
        let line = columns
            .iter()
            .map(|column| {
                let value = row.as_object().and_then(|obj| obj.get(column));
                csv_escape(cell_display_string(value).as_str())
            })
            .collect::<Vec<_>>()
            .join(",");
        lines.push(line);
    }
    lines.join("\n")
}

fn save_csv_dialog(filename: &str, content: &str) -> Result<SaveCsvResult, String> {
    let default_name = sanitize_export_filename(filename);
    let path = rfd::FileDialog::new()
        .set_file_name(default_name.as_str())
        .save_file();
    let Some(path) = path else {
        return Ok(SaveCsvResult {
            ok: false,
            canceled: true,
            filename: default_name,
            path: None,
            error: None,
        });
    };
    write_text_file(path.clone(), content)?;
    Ok(SaveCsvResult {
        ok: true,
        canceled: false,
        filename: default_name,
        path: Some(path.to_string_lossy().to_string()),
        error: None,
    })
}

// ---------------------------------------------------------------------------
// Backup
// ---------------------------------------------------------------------------

fn build_backup_value(store: &KvStore) -> serde_json::Value {
    let mut out = serde_json::Map::new();
    for key in store.keys() {
        if let Some(value) = store.get(key.as_str()) {
            out.insert(key, value);
        }
    }
    serde_json::Value::Object(out)
}

/// Replace-mode restore: validates every recognized entry first, then clears
/// the namespace and writes the backup contents.
fn apply_backup_value(store: &KvStore, backup: &serde_json::Value) -> Result<usize, String> {
    let Some(entries) = backup.as_object() else {
        return Err("Invalid backup file.".to_string());
    };
    for (key, entry) in entries {
        if key == CURRENT_USER_KEY {
            if !entry.is_object() {
                return Err(format!("Backup entry for {key} must be a record."));
            }
        } else if COLLECTIONS.contains(&key.as_str()) && !entry.is_array() {
            return Err(format!("Backup entry for {key} must be a list."));
        }
    }
    store.clear();
    let mut applied = 0;
    for (key, entry) in entries {
        if key == CURRENT_USER_KEY || COLLECTIONS.contains(&key.as_str()) {
            store.set(key.as_str(), entry);
            applied += 1;
        } else {
            tracing::warn!(key = key.as_str(), "skipping unknown backup key");
        }
    }
    Ok(applied)
}

// ---------------------------------------------------------------------------
// Seed data
// ---------------------------------------------------------------------------

/// Populates the demo dataset exactly once. The gate is the projects
/// collection: if it already holds records the whole bootstrap is a no-op.
fn seed_demo_data(store: &KvStore) {
    let projects: Vec<Project> = collection_all(store);
    if !projects.is_empty() {
        return;
    }
    tracing::info!("seeding demo dataset");
    seed_clients(store);
    seed_projects(store);
    seed_boq_items(store);
    seed_running_bills(store);
    seed_invoices(store);
    seed_vendors(store);
    seed_materials(store);
    seed_equipment(store);
    seed_daily_reports(store);
}

fn seed_clients(store: &KvStore) {
    let clients = vec![
        Client {
            id: "client_1".to_string(),
            name: "Mumbai Metropolitan Development".to_string(),
            email: "contact@mmd.com".to_string(),
            phone: "+91 22-4040-0000".to_string(),
            address: Some("123 Business Plaza, Mumbai".to_string()),
            city: Some("Mumbai".to_string()),
            state: Some("Maharashtra".to_string()),
            zip_code: Some("400001".to_string()),
            gstin: Some("27AAPPP7890A1Z5".to_string()),
            contact_person: Some("Rajesh Kumar".to_string()),
            created_at: "2024-01-15T00:00:00.000Z".to_string(),
        },
        Client {
            id: "client_2".to_string(),
            name: "Bangalore Infrastructure Ltd".to_string(),
            email: "projects@bil.co.in".to_string(),
            phone: "+91 80-3040-5000".to_string(),
            address: Some("Tech Tower, Bangalore".to_string()),
            city: Some("Bangalore".to_string()),
            state: Some("Karnataka".to_string()),
            zip_code: Some("560042".to_string()),
            gstin: Some("29AAPPP1234B2Z3".to_string()),
            contact_person: Some("Priya Sharma".to_string()),
            created_at: "2024-02-01T00:00:00.000Z".to_string(),
        },
        Client {
            id: "client_3".to_string(),
            name: "Delhi Metro Rail Corporation".to_string(),
            email: "tender@dmrc.co.in".to_string(),
            phone: "+91 11-4040-0000".to_string(),
            address: Some("DMRC Headquarters, Delhi".to_string()),
            city: Some("Delhi".to_string()),
            state: Some("Delhi".to_string()),
            zip_code: Some("110001".to_string()),
            gstin: Some("07AAPPP5678C2Z1".to_string()),
            contact_person: Some("Amit Verma".to_string()),
            created_at: "2024-02-10T00:00:00.000Z".to_string(),
        },
    ];
    store.set("clients", &clients);
}

fn seed_projects(store: &KvStore) {
    let projects = vec![
        Project {
            id: "proj_1".to_string(),
            name: "Luxury Apartment Complex - Phase 1".to_string(),
            client_id: "client_1".to_string(),
            description: Some("Construction of 250-unit luxury residential complex".to_string()),
            start_date: "2024-01-15".to_string(),
            end_date: "2025-06-30".to_string(),
            budget: 5_000_000.0,
            status: ProjectStatus::Ongoing,
            location: Some("Powai, Mumbai".to_string()),
            created_at: "2024-01-15T00:00:00.000Z".to_string(),
            updated_at: now_iso(),
        },
        Project {
            id: "proj_2".to_string(),
            name: "Commercial Office Building".to_string(),
            client_id: "client_2".to_string(),
            description: Some("15-story commercial complex with retail space".to_string()),
            start_date: "2024-03-01".to_string(),
            end_date: "2025-12-31".to_string(),
            budget: 7_500_000.0,
            status: ProjectStatus::Ongoing,
            location: Some("Whitefield, Bangalore".to_string()),
            created_at: "2024-03-01T00:00:00.000Z".to_string(),
            updated_at: now_iso(),
        },
        Project {
            id: "proj_3".to_string(),
            name: "Metro Station Extension".to_string(),
            client_id: "client_3".to_string(),
            description: Some("Civil construction for new metro station".to_string()),
            start_date: "2024-02-01".to_string(),
            end_date: "2025-03-31".to_string(),
            budget: 12_000_000.0,
            status: ProjectStatus::Ongoing,
            location: Some("East Delhi".to_string()),
            created_at: "2024-02-01T00:00:00.000Z".to_string(),
            updated_at: now_iso(),
        },
        Project {
            id: "proj_4".to_string(),
            name: "Educational Institution Campus".to_string(),
            client_id: "client_1".to_string(),
            description: Some("Campus infrastructure development - completed".to_string()),
            start_date: "2023-01-01".to_string(),
            end_date: "2024-11-30".to_string(),
            budget: 3_500_000.0,
            status: ProjectStatus::Completed,
            location: Some("Thane, Mumbai".to_string()),
            created_at: "2023-01-01T00:00:00.000Z".to_string(),
            updated_at: now_iso(),
        },
    ];
    store.set("projects", &projects);
}

fn seed_boq_items(store: &KvStore) {
    let items = vec![
        BoqItem {
            id: "boq_1".to_string(),
            project_id: "proj_1".to_string(),
            item_name: "Excavation & Foundation".to_string(),
            description: Some("Earth excavation and RCC foundation".to_string()),
            quantity: 5000.0,
            unit: "cum".to_string(),
            rate: 500.0,
            total_amount: 2_500_000.0,
            created_at: now_iso(),
        },
        BoqItem {
            id: "boq_2".to_string(),
            project_id: "proj_1".to_string(),
            item_name: "Structural Steel Work".to_string(),
            description: Some("Structural steel columns and beams".to_string()),
            quantity: 800.0,
            unit: "ton".to_string(),
            rate: 50_000.0,
            total_amount: 40_000_000.0,
            created_at: now_iso(),
        },
        BoqItem {
            id: "boq_3".to_string(),
            project_id: "proj_2".to_string(),
            item_name: "Pile Foundation".to_string(),
            description: Some("Deep pile foundation work".to_string()),
            quantity: 250.0,
            unit: "no".to_string(),
            rate: 100_000.0,
            total_amount: 25_000_000.0,
            created_at: now_iso(),
        },
        BoqItem {
            id: "boq_4".to_string(),
            project_id: "proj_2".to_string(),
            item_name: "RCC Columns".to_string(),
            description: Some("RCC column casting and finishing".to_string()),
            quantity: 2000.0,
            unit: "cum".to_string(),
            rate: 8000.0,
            total_amount: 16_000_000.0,
            created_at: now_iso(),
        },
        BoqItem {
            id: "boq_5".to_string(),
            project_id: "proj_3".to_string(),
            item_name: "Tunnel Excavation".to_string(),
            description: Some("Underground tunnel boring".to_string()),
            quantity: 3000.0,
            unit: "cum".to_string(),
            rate: 3000.0,
            total_amount: 9_000_000.0,
            created_at: now_iso(),
        },
        BoqItem {
            id: "boq_6".to_string(),
            project_id: "proj_3".to_string(),
            item_name: "Tunnel Lining".to_string(),
            description: Some("Concrete lining for tunnel".to_string()),
            quantity: 5000.0,
            unit: "sqm".to_string(),
            rate: 500.0,
            total_amount: 2_500_000.0,
            created_at: now_iso(),
        },
    ];
    store.set("boq_items", &items);
}

fn seed_running_bills(store: &KvStore) {
    let bills = vec![
        RunningBill {
            id: "bill_1".to_string(),
            project_id: "proj_1".to_string(),
            bill_number: "RB/2024/001".to_string(),
            bill_date: "2024-02-15".to_string(),
            boq_items: vec![BillLine {
                item_id: "boq_1".to_string(),
                quantity: 1000.0,
                rate: 500.0,
                total: 500_000.0,
            }],
            subtotal: 500_000.0,
            retention_percentage: 10.0,
            retention_amount: 50_000.0,
            bill_amount: 450_000.0,
            status: BillStatus::Approved,
            created_at: now_iso(),
            updated_at: now_iso(),
        },
        RunningBill {
            id: "bill_2".to_string(),
            project_id: "proj_2".to_string(),
            bill_number: "RB/2024/002".to_string(),
            bill_date: "2024-03-20".to_string(),
            boq_items: vec![BillLine {
                item_id: "boq_3".to_string(),
                quantity: 50.0,
                rate: 100_000.0,
                total: 5_000_000.0,
            }],
            subtotal: 5_000_000.0,
            retention_percentage: 10.0,
            retention_amount: 500_000.0,
            bill_amount: 4_500_000.0,
            status: BillStatus::Approved,
            created_at: now_iso(),
            updated_at: now_iso(),
        },
    ];
    store.set("running_bills", &bills);
}

fn seed_invoices(store: &KvStore) {
    let invoices = vec![
        Invoice {
            id: "inv_1".to_string(),
            project_id: "proj_1".to_string(),
            invoice_number: "INV/2024/001".to_string(),
            bill_id: "bill_1".to_string(),
            invoice_date: "2024-02-15".to_string(),
            due_date: "2024-03-15".to_string(),
            amount: 450_000.0,
            tax: 81_000.0,
            total_amount: 531_000.0,
            status: InvoiceStatus::Paid,
            client_id: "client_1".to_string(),
            created_at: now_iso(),
        },
        Invoice {
            id: "inv_2".to_string(),
            project_id: "proj_2".to_string(),
            invoice_number: "INV/2024/002".to_string(),
            bill_id: "bill_2".to_string(),
            invoice_date: "2024-03-20".to_string(),
            due_date: "2024-04-20".to_string(),
            amount: 4_500_000.0,
            tax: 810_000.0,
            total_amount: 5_310_000.0,
            status: InvoiceStatus::Sent,
            client_id: "client_2".to_string(),
            created_at: now_iso(),
        },
    ];
    store.set("invoices", &invoices);
}

fn seed_vendors(store: &KvStore) {
    let vendors = vec![
        Vendor {
            id: "vendor_1".to_string(),
            name: "Steel Supplies India Ltd".to_string(),
            category: VendorCategory::Material,
            email: Some("sales@steelsupplies.com".to_string()),
            phone: "+91 98765-43210".to_string(),
            address: Some("Industrial Estate, Mumbai".to_string()),
            bank_account: None,
            gstin: Some("27AAPPP0000A1Z5".to_string()),
            created_at: now_iso(),
        },
        Vendor {
            id: "vendor_2".to_string(),
            name: "Concrete Pumping Services".to_string(),
            category: VendorCategory::Labor,
            email: Some("info@concretepump.com".to_string()),
            phone: "+91 98765-43211".to_string(),
            address: Some("Construction Hub, Bangalore".to_string()),
            bank_account: None,
            gstin: None,
            created_at: now_iso(),
        },
        Vendor {
            id: "vendor_3".to_string(),
            name: "Heavy Equipment Rentals".to_string(),
            category: VendorCategory::Equipment,
            email: Some("rentals@heavyequip.com".to_string()),
            phone: "+91 98765-43212".to_string(),
            address: Some("Equipment Park, Delhi".to_string()),
            bank_account: None,
            gstin: None,
            created_at: now_iso(),
        },
    ];
    store.set("vendors", &vendors);
}

fn seed_materials(store: &KvStore) {
    let materials = vec![
        Material {
            id: "mat_1".to_string(),
            name: "Cement (50kg bag)".to_string(),
            description: None,
            unit: "bag".to_string(),
            category: "cement".to_string(),
            reorder_level: 500.0,
            created_at: now_iso(),
        },
        Material {
            id: "mat_2".to_string(),
            name: "Steel Bars (10mm)".to_string(),
            description: None,
            unit: "ton".to_string(),
            category: "steel".to_string(),
            reorder_level: 50.0,
            created_at: now_iso(),
        },
        Material {
            id: "mat_3".to_string(),
            name: "Fine Sand".to_string(),
            description: None,
            unit: "cum".to_string(),
            category: "aggregates".to_string(),
            reorder_level: 100.0,
            created_at: now_iso(),
        },
        Material {
            id: "mat_4".to_string(),
            name: "Coarse Aggregate 20mm".to_string(),
            description: None,
            unit: "cum".to_string(),
            category: "aggregates".to_string(),
            reorder_level: 150.0,
            created_at: now_iso(),
        },
    ];
    let stocks: Vec<MaterialStock> = materials
        .iter()
        .map(|material| MaterialStock {
            id: format!("stock_{}", material.id),
            material_id: material.id.clone(),
            current_stock: (material.reorder_level * 1.5).floor(),
            last_updated: now_iso(),
        })
        .collect();
    store.set("materials", &materials);
    store.set("material_stock", &stocks);
}

fn seed_equipment(store: &KvStore) {
    let equipment = vec![
        Equipment {
            id: "equip_1".to_string(),
            name: "Excavator CAT 320".to_string(),
            category: "excavator".to_string(),
            serial_number: Some("CAT-2024-001".to_string()),
            purchase_date: Some("2022-06-15".to_string()),
            purchase_value: Some(2_500_000.0),
            status: EquipmentStatus::InUse,
            created_at: now_iso(),
        },
        Equipment {
            id: "equip_2".to_string(),
            name: "Tower Crane Liebherr 500HC".to_string(),
            category: "crane".to_string(),
            serial_number: Some("LBH-2023-456".to_string()),
            purchase_date: Some("2023-03-20".to_string()),
            purchase_value: Some(5_000_000.0),
            status: EquipmentStatus::InUse,
            created_at: now_iso(),
        },
        Equipment {
            id: "equip_3".to_string(),
            name: "Concrete Pump".to_string(),
            category: "pump".to_string(),
            serial_number: Some("PUMP-2024-789".to_string()),
            purchase_date: Some("2024-01-10".to_string()),
            purchase_value: Some(1_500_000.0),
            status: EquipmentStatus::Available,
            created_at: now_iso(),
        },
    ];
    let allocations = vec![
        EquipmentAllocation {
            id: "alloc_1".to_string(),
            equipment_id: "equip_1".to_string(),
            project_id: "proj_1".to_string(),
            allocation_date: "2024-01-20".to_string(),
            deallocation_date: None,
            created_at: now_iso(),
        },
        EquipmentAllocation {
            id: "alloc_2".to_string(),
            equipment_id: "equip_2".to_string(),
            project_id: "proj_2".to_string(),
            allocation_date: "2024-03-05".to_string(),
            deallocation_date: None,
            created_at: now_iso(),
        },
    ];
    store.set("equipment", &equipment);
    store.set("equipment_allocations", &allocations);
}

fn seed_daily_reports(store: &KvStore) {
    let reports = vec![
        DailyReport {
            id: "report_1".to_string(),
            project_id: "proj_1".to_string(),
            report_date: "2024-12-20".to_string(),
            site_engineer: "Rajesh Kumar".to_string(),
            work_description: "Foundation excavation work on Block A".to_string(),
            quantity_executed: 500.0,
            unit: "cum".to_string(),
            boq_item_id: Some("boq_1".to_string()),
            weather: Some("Partly cloudy, temperature 28°C".to_string()),
            no_of_workers: Some(25),
            remarks: Some("Work progressing as per schedule".to_string()),
            photos: Vec::new(),
            created_at: now_iso(),
        },
        DailyReport {
            id: "report_2".to_string(),
            project_id: "proj_2".to_string(),
            report_date: "2024-12-20".to_string(),
            site_engineer: "Priya Sharma".to_string(),
            work_description: "Pile cap casting for east wing".to_string(),
            quantity_executed: 50.0,
            unit: "no".to_string(),
            boq_item_id: Some("boq_3".to_string()),
            weather: Some("Clear and dry".to_string()),
            no_of_workers: Some(30),
            remarks: Some("Quality checks completed and passed".to_string()),
            photos: Vec::new(),
            created_at: now_iso(),
        },
    ];
    store.set("daily_reports", &reports);
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_env("ERPCIVIL_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn main() {
    init_tracing();
    tauri::Builder::default()
        .plugin(tauri_plugin_opener::init())
        .plugin(tauri_plugin_clipboard_manager::init())
        .manage(Mutex::new(SessionState::default()))
        .setup(|app| {
            let store = app_store(app.handle()).map_err(Box::<dyn std::error::Error>::from)?;
            seed_demo_data(&store);
            if let Some(user) = store.get_as::<User>(CURRENT_USER_KEY) {
                let state = app.state::<Mutex<SessionState>>();
                if let Ok(mut session) = state.lock() {
                    session.user = Some(user);
                };
            }
            Ok(())
        })
        .invoke_handler(tauri::generate_handler![
            app_version,
            platform_name,
            storage_info,
            window_minimize,
            window_maximize,
            window_unmaximize,
            window_toggle_maximize,
            window_is_maximized,
            window_close,
            clipboard_write,
            open_external,
            auth_login_role,
            auth_logout,
            auth_current,
            auth_has_permission,
            auth_can_perform,
            nav_modules,
            module_get,
            module_set,
            project_list,
            project_get,
            project_create,
            project_update,
            project_delete,
            client_list,
            client_create,
            client_update,
            client_delete,
            boq_list,
            boq_create,
            boq_update,
            boq_delete,
            bill_list,
            bill_create,
            bill_update,
            bill_delete,
            invoice_list,
            invoice_create,
            invoice_update,
            invoice_delete,
            vendor_list,
            vendor_create,
            vendor_update,
            vendor_delete,
            material_list,
            material_create,
            material_update,
            material_delete,
            stock_list,
            stock_set,
            equipment_list,
            equipment_create,
            equipment_update,
            equipment_delete,
            allocation_list,
            equipment_allocate,
            equipment_release,
            daily_report_list,
            daily_report_create,
            daily_report_update,
            daily_report_delete,
            dashboard_kpis,
            project_summary_report,
            billing_summary_report,
            pending_payments_report,
            save_csv_file,
            collection_export_csv,
            backup_export,
            backup_import
        ])
        .run(tauri::generate_context!())
        .expect("failed to run ERP Civil");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> (tempfile::TempDir, KvStore) {
        let temp = tempfile::tempdir().expect("tempdir should create");
        let store = KvStore::open(temp.path());
        (temp, store)
    }

    fn sample_project_form(name: &str, budget: f64) -> serde_json::Value {
        json!({
            "name": name,
            "clientId": "client_1",
            "startDate": "2024-01-15",
            "endDate": "2025-06-30",
            "budget": budget,
            "status": "ongoing",
            "location": "Powai, Mumbai",
        })
    }

    #[test]
    fn store_round_trips_values() {
        let (_temp, store) = test_store();
        let value = json!({
            "nested": { "list": [1, 2, 3], "flag": true },
            "text": "hello",
        });
        store.set("scratch", &value);
        assert_eq!(store.get("scratch"), Some(value));
    }

    #[test]
    fn store_missing_key_is_none() {
        let (_temp, store) = test_store();
        assert_eq!(store.get("never_written"), None);
    }

    #[test]
    fn store_masks_unreadable_values_as_none() {
        let (_temp, store) = test_store();
        store.set("scratch", &json!(["fine"]));
        fs::write(store.key_path("scratch"), "{not json").expect("write should succeed");
        assert_eq!(store.get("scratch"), None);
    }

    #[test]
    fn store_clear_leaves_foreign_files_alone() {
        let temp = tempfile::tempdir().expect("tempdir should create");
        let store = KvStore::open(temp.path());
        store.set("projects", &json!([]));
        store.set("clients", &json!([]));
        let outside = temp.path().join("outside.json");
        fs::write(&outside, "{}").expect("write should succeed");

        store.clear();

        assert!(store.keys().is_empty());
        assert!(outside.exists());
    }

    #[test]
    fn store_keys_are_sorted_namespace_keys() {
        let (_temp, store) = test_store();
        store.set("projects", &json!([]));
        store.set("clients", &json!([]));
        assert_eq!(store.keys(), vec!["clients", "projects"]);
    }

    #[test]
    fn create_appends_one_matching_record_with_unique_id() {
        let (_temp, store) = test_store();
        let first = create_project(&store, &sample_project_form("Alpha", 5_000_000.0))
            .expect("create should succeed");
        let second = create_project(&store, &sample_project_form("Beta", 1_000_000.0))
            .expect("create should succeed");

        let all: Vec<Project> = collection_all(&store);
        assert_eq!(all.len(), 2);
        assert_ne!(first.id, second.id);
        assert!(first.id.starts_with("proj_"));
        assert_eq!(all[0].name, "Alpha");
        assert_eq!(all[0].budget, 5_000_000.0);
        assert_eq!(all[0].status, ProjectStatus::Ongoing);
    }

    #[test]
    fn get_by_id_scans_the_collection() {
        let (_temp, store) = test_store();
        let created = create_project(&store, &sample_project_form("Alpha", 100.0))
            .expect("create should succeed");
        let found: Option<Project> = collection_find(&store, created.id.as_str());
        assert_eq!(found, Some(created));
        assert_eq!(collection_find::<Project>(&store, "proj_missing"), None);
    }

    #[test]
    fn update_merges_partial_and_refreshes_timestamp() {
        let (_temp, store) = test_store();
        let created = create_project(&store, &sample_project_form("Alpha", 100.0))
            .expect("create should succeed");
        std::thread::sleep(std::time::Duration::from_millis(5));

        let updated = update_project(&store, created.id.as_str(), &json!({ "budget": 250.0 }))
            .expect("update should validate")
            .expect("record should exist");

        assert_eq!(updated.budget, 250.0);
        assert_eq!(updated.name, created.name);
        assert_eq!(updated.created_at, created.created_at);
        assert!(updated.updated_at > created.updated_at);
    }

    #[test]
    fn update_missing_id_leaves_collection_untouched() {
        let (_temp, store) = test_store();
        create_project(&store, &sample_project_form("Alpha", 100.0))
            .expect("create should succeed");
        let before = fs::read_to_string(store.key_path("projects")).expect("file should exist");

        let result = update_project(&store, "proj_missing", &json!({ "budget": 1.0 }))
            .expect("update should validate");

        let after = fs::read_to_string(store.key_path("projects")).expect("file should exist");
        assert_eq!(result, None);
        assert_eq!(before, after);
    }

    #[test]
    fn update_never_touches_unlisted_fields() {
        let (_temp, store) = test_store();
        let created = create_project(&store, &sample_project_form("Alpha", 100.0))
            .expect("create should succeed");

        let updated = update_project(
            &store,
            created.id.as_str(),
            &json!({ "id": "proj_hijacked", "createdAt": "1970-01-01", "name": "Renamed" }),
        )
        .expect("update should validate")
        .expect("record should exist");

        assert_eq!(updated.id, created.id);
        assert_eq!(updated.created_at, created.created_at);
        assert_eq!(updated.name, "Renamed");
    }

    #[test]
    fn delete_filters_record_and_always_reports_success() {
        let (_temp, store) = test_store();
        let created = create_project(&store, &sample_project_form("Alpha", 100.0))
            .expect("create should succeed");

        assert!(collection_remove::<Project>(&store, created.id.as_str()));
        assert!(collection_all::<Project>(&store).is_empty());

        // Deleting an id that never existed is a tolerated no-op.
        assert!(collection_remove::<Project>(&store, "proj_missing"));
        assert!(collection_all::<Project>(&store).is_empty());
    }

    #[test]
    fn invalid_number_is_rejected_without_writing() {
        let (_temp, store) = test_store();
        let mut form = sample_project_form("Alpha", 100.0);
        form["budget"] = json!("not-a-number");
        let err = create_project(&store, &form).expect_err("budget should be rejected");
        assert!(err.contains("budget"));
        assert!(collection_all::<Project>(&store).is_empty());
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let (_temp, store) = test_store();
        let err = create_project(&store, &json!({ "name": "Alpha" }))
            .expect_err("clientId should be required");
        assert!(err.contains("clientId"));
    }

    #[test]
    fn invalid_enum_value_is_rejected() {
        let (_temp, store) = test_store();
        let mut form = sample_project_form("Alpha", 100.0);
        form["status"] = json!("bogus");
        let err = create_project(&store, &form).expect_err("status should be rejected");
        assert!(err.contains("status"));
    }

    #[test]
    fn numeric_strings_are_coerced_at_the_boundary() {
        let (_temp, store) = test_store();
        let mut form = sample_project_form("Alpha", 0.0);
        form["budget"] = json!("5000000");
        let created = create_project(&store, &form).expect("create should succeed");
        assert_eq!(created.budget, 5_000_000.0);
    }

    #[test]
    fn boq_total_is_quantity_times_rate() {
        let (_temp, store) = test_store();
        let project = create_project(&store, &sample_project_form("Alpha", 5_000_000.0))
            .expect("create should succeed");
        let item = create_boq_item(
            &store,
            &json!({
                "projectId": project.id,
                "itemName": "Excavation & Foundation",
                "quantity": 5000,
                "unit": "cum",
                "rate": 500,
            }),
        )
        .expect("create should succeed");
        assert_eq!(item.total_amount, 2_500_000.0);
    }

    #[test]
    fn boq_update_recomputes_total_from_merged_fields() {
        let (_temp, store) = test_store();
        let item = create_boq_item(
            &store,
            &json!({
                "projectId": "proj_1",
                "itemName": "Excavation",
                "quantity": 100,
                "unit": "cum",
                "rate": 500,
            }),
        )
        .expect("create should succeed");

        let updated = update_boq_item(&store, item.id.as_str(), &json!({ "rate": 600 }))
            .expect("update should validate")
            .expect("record should exist");

        assert_eq!(updated.quantity, 100.0);
        assert_eq!(updated.rate, 600.0);
        assert_eq!(updated.total_amount, 60_000.0);
    }

    #[test]
    fn bill_retention_math_matches_stated_formula() {
        let (_temp, store) = test_store();
        let bill = create_running_bill(
            &store,
            &json!({
                "projectId": "proj_1",
                "billNumber": "RB/2024/009",
                "billDate": "2024-06-01",
                "billAmount": 450_000,
                "retentionPercentage": 10,
            }),
        )
        .expect("create should succeed");

        assert_eq!(bill.retention_amount, 45_000.0);
        assert_eq!(bill.subtotal, 495_000.0);
        assert_eq!(bill.status, BillStatus::Draft);
    }

    #[test]
    fn bill_retention_defaults_to_ten_percent() {
        let (_temp, store) = test_store();
        let bill = create_running_bill(
            &store,
            &json!({
                "projectId": "proj_1",
                "billNumber": "RB/2024/010",
                "billDate": "2024-06-01",
                "billAmount": 100_000,
            }),
        )
        .expect("create should succeed");
        assert_eq!(bill.retention_percentage, 10.0);
        assert_eq!(bill.retention_amount, 10_000.0);
    }

    #[test]
    fn bill_lines_capture_quantity_rate_and_total() {
        let (_temp, store) = test_store();
        let bill = create_running_bill(
            &store,
            &json!({
                "projectId": "proj_1",
                "billNumber": "RB/2024/011",
                "billDate": "2024-06-01",
                "billAmount": 500_000,
                "boqItems": [ { "itemId": "boq_1", "quantity": 1000, "rate": 500 } ],
            }),
        )
        .expect("create should succeed");
        assert_eq!(bill.boq_items.len(), 1);
        assert_eq!(bill.boq_items[0].total, 500_000.0);
    }

    #[test]
    fn bill_status_update_flows_through_whitelist() {
        let (_temp, store) = test_store();
        let bill = create_running_bill(
            &store,
            &json!({
                "projectId": "proj_1",
                "billNumber": "RB/2024/012",
                "billDate": "2024-06-01",
                "billAmount": 1000,
            }),
        )
        .expect("create should succeed");

        let updated =
            update_running_bill(&store, bill.id.as_str(), &json!({ "status": "approved" }))
                .expect("update should validate")
                .expect("record should exist");
        assert_eq!(updated.status, BillStatus::Approved);
    }

    #[test]
    fn invoice_applies_gst_on_creation() {
        let (_temp, store) = test_store();
        let invoice = create_invoice(
            &store,
            &json!({
                "projectId": "proj_1",
                "clientId": "client_1",
                "invoiceNumber": "INV/2024/009",
                "billId": "bill_1",
                "dueDate": "2024-07-01",
                "amount": 100_000,
            }),
        )
        .expect("create should succeed");
        assert_eq!(invoice.tax, 18_000.0);
        assert_eq!(invoice.total_amount, 118_000.0);
        assert_eq!(invoice.status, InvoiceStatus::Draft);
    }

    #[test]
    fn material_create_bootstraps_an_empty_stock_row() {
        let (_temp, store) = test_store();
        let material = create_material(
            &store,
            &json!({
                "name": "Cement (50kg bag)",
                "unit": "bag",
                "category": "cement",
                "reorderLevel": 500,
            }),
        )
        .expect("create should succeed");

        let stocks: Vec<MaterialStock> = collection_all(&store);
        assert_eq!(stocks.len(), 1);
        assert_eq!(stocks[0].material_id, material.id);
        assert_eq!(stocks[0].current_stock, 0.0);
        assert_eq!(stocks[0].id, format!("stock_{}", material.id));
    }

    #[test]
    fn stock_set_upserts_by_material() {
        let (_temp, store) = test_store();
        let material = create_material(
            &store,
            &json!({
                "name": "Fine Sand",
                "unit": "cum",
                "category": "aggregates",
                "reorderLevel": 100,
            }),
        )
        .expect("create should succeed");

        let stock = set_material_stock(
            &store,
            &json!({ "materialId": material.id, "currentStock": 150 }),
        )
        .expect("set should succeed");
        assert_eq!(stock.current_stock, 150.0);

        let stocks: Vec<MaterialStock> = collection_all(&store);
        assert_eq!(stocks.len(), 1);
    }

    #[test]
    fn allocation_and_release_track_equipment_status() {
        let (_temp, store) = test_store();
        let equipment = create_equipment(
            &store,
            &json!({ "name": "Concrete Pump", "category": "pump" }),
        )
        .expect("create should succeed");
        assert_eq!(equipment.status, EquipmentStatus::Available);

        let allocation = create_allocation(
            &store,
            &json!({ "equipmentId": equipment.id, "projectId": "proj_1" }),
        )
        .expect("allocate should succeed");
        let in_use: Equipment =
            collection_find(&store, equipment.id.as_str()).expect("equipment should exist");
        assert_eq!(in_use.status, EquipmentStatus::InUse);
        assert_eq!(allocation.deallocation_date, None);

        let released =
            release_allocation(&store, allocation.id.as_str()).expect("release should succeed");
        assert!(released.deallocation_date.is_some());
        let available: Equipment =
            collection_find(&store, equipment.id.as_str()).expect("equipment should exist");
        assert_eq!(available.status, EquipmentStatus::Available);
    }

    #[test]
    fn daily_report_rejects_undecodable_photos() {
        let (_temp, store) = test_store();
        let err = create_daily_report(
            &store,
            &json!({
                "projectId": "proj_1",
                "siteEngineer": "Rajesh Kumar",
                "workDescription": "Foundation excavation",
                "quantityExecuted": 500,
                "unit": "cum",
                "photos": ["@@not-base64@@"],
            }),
        )
        .expect_err("photos should be rejected");
        assert!(err.contains("photo"));

        let report = create_daily_report(
            &store,
            &json!({
                "projectId": "proj_1",
                "siteEngineer": "Rajesh Kumar",
                "workDescription": "Foundation excavation",
                "quantityExecuted": 500,
                "unit": "cum",
                "photos": ["data:image/png;base64,aGVsbG8="],
            }),
        )
        .expect("create should succeed");
        assert_eq!(report.photos.len(), 1);
    }

    #[test]
    fn seed_runs_once_and_is_idempotent() {
        let (_temp, store) = test_store();
        seed_demo_data(&store);
        let snapshot: Vec<Option<serde_json::Value>> =
            COLLECTIONS.iter().map(|key| store.get(key)).collect();
        assert_eq!(collection_all::<Project>(&store).len(), 4);

        seed_demo_data(&store);
        let after: Vec<Option<serde_json::Value>> =
            COLLECTIONS.iter().map(|key| store.get(key)).collect();
        assert_eq!(snapshot, after);
    }

    #[test]
    fn seed_skips_when_projects_already_exist() {
        let (_temp, store) = test_store();
        create_project(&store, &sample_project_form("Alpha", 100.0))
            .expect("create should succeed");
        seed_demo_data(&store);
        assert!(collection_all::<Client>(&store).is_empty());
        assert_eq!(collection_all::<Project>(&store).len(), 1);
    }

    #[test]
    fn seed_foreign_keys_all_resolve() {
        let (_temp, store) = test_store();
        seed_demo_data(&store);
        let clients: Vec<Client> = collection_all(&store);
        let projects: Vec<Project> = collection_all(&store);
        let boq_items: Vec<BoqItem> = collection_all(&store);
        let bills: Vec<RunningBill> = collection_all(&store);
        let invoices: Vec<Invoice> = collection_all(&store);
        let materials: Vec<Material> = collection_all(&store);
        let stocks: Vec<MaterialStock> = collection_all(&store);
        let equipment: Vec<Equipment> = collection_all(&store);
        let allocations: Vec<EquipmentAllocation> = collection_all(&store);
        let reports: Vec<DailyReport> = collection_all(&store);

        let has_client = |id: &str| clients.iter().any(|c| c.id == id);
        let has_project = |id: &str| projects.iter().any(|p| p.id == id);
        let has_boq = |id: &str| boq_items.iter().any(|b| b.id == id);
        let has_bill = |id: &str| bills.iter().any(|b| b.id == id);

        assert!(projects.iter().all(|p| has_client(p.client_id.as_str())));
        assert!(boq_items.iter().all(|b| has_project(b.project_id.as_str())));
        assert!(bills.iter().all(|b| has_project(b.project_id.as_str())));
        assert!(bills
            .iter()
            .flat_map(|b| b.boq_items.iter())
            .all(|line| has_boq(line.item_id.as_str())));
        assert!(invoices.iter().all(|i| has_project(i.project_id.as_str())
            && has_client(i.client_id.as_str())
            && has_bill(i.bill_id.as_str())));
        assert!(stocks
            .iter()
            .all(|s| materials.iter().any(|m| m.id == s.material_id)));
        assert!(allocations
            .iter()
            .all(|a| equipment.iter().any(|e| e.id == a.equipment_id)
                && has_project(a.project_id.as_str())));
        assert!(reports.iter().all(|r| has_project(r.project_id.as_str())
            && r.boq_item_id
                .as_deref()
                .map(|id| has_boq(id))
                .unwrap_or(true)));
    }

    #[test]
    fn finance_role_permission_matrix() {
        let user = default_user(UserRole::Finance);
        assert_eq!(user.role, UserRole::Finance);
        assert!(!has_permission(Some(&user), "financial"));
        assert!(has_permission(Some(&user), "billing"));
        assert!(!can_perform(Some(&user), "projects", "create"));
        assert!(!can_perform(Some(&user), "projects", "view"));
        assert!(can_perform(Some(&user), "financial", "view"));
    }

    #[test]
    fn admin_view_all_grants_everything() {
        let user = default_user(UserRole::Admin);
        assert!(can_perform(Some(&user), "projects", "delete"));
        assert!(can_perform(Some(&user), "anything", "view"));
        assert!(has_permission(Some(&user), "financial"));
    }

    #[test]
    fn logged_out_users_have_no_permissions() {
        assert!(!has_permission(None, "billing"));
        assert!(!can_perform(None, "projects", "view"));
    }

    #[test]
    fn unknown_actions_are_denied_for_non_admins() {
        let user = default_user(UserRole::ProjectManager);
        assert!(!can_perform(Some(&user), "projects", "export"));
    }

    #[test]
    fn navigation_gate_filters_modules_by_role() {
        assert_eq!(
            visible_modules(UserRole::SiteEngineer),
            vec![Module::Dashboard, Module::DailyReports]
        );
        assert_eq!(
            visible_modules(UserRole::Finance),
            vec![
                Module::Dashboard,
                Module::Billing,
                Module::Invoices,
                Module::Clients,
                Module::Reports,
            ]
        );
        assert_eq!(visible_modules(UserRole::Admin).len(), ALL_MODULES.len());
    }

    #[test]
    fn session_login_persists_and_logout_clears() {
        let (_temp, store) = test_store();
        let mut session = SessionState::default();

        let user = session_login(&store, &mut session, UserRole::Finance);
        assert_eq!(user.role, UserRole::Finance);
        assert_eq!(store.get_as::<User>(CURRENT_USER_KEY), Some(user));

        session_logout(&store, &mut session);
        assert_eq!(session.user, None);
        assert_eq!(store.get_as::<User>(CURRENT_USER_KEY), None);
    }

    #[test]
    fn dashboard_kpis_fold_over_seeded_collections() {
        let (_temp, store) = test_store();
        seed_demo_data(&store);
        let kpis = dashboard_kpis_value(&store);

        assert_eq!(kpis.total_projects, 4);
        assert_eq!(kpis.ongoing_projects, 3);
        assert_eq!(kpis.completed_projects, 1);
        assert_eq!(kpis.total_budget, 28_000_000.0);
        assert_eq!(kpis.total_billed, 4_950_000.0);
        assert_eq!(kpis.paid_amount, 531_000.0);
        assert_eq!(kpis.pending_payments, 5_310_000.0);
        // 531,000 paid against 2,970,000 assumed cost floors at zero.
        assert_eq!(kpis.profit_estimate, 0.0);
    }

    #[test]
    fn project_summary_reports_margin_against_budget() {
        let (_temp, store) = test_store();
        seed_demo_data(&store);
        let rows = project_summary_rows(&store);
        let first = rows
            .iter()
            .find(|row| row.project_name == "Luxury Apartment Complex - Phase 1")
            .expect("seeded project should be present");

        assert_eq!(first.billed, 450_000.0);
        assert_eq!(first.invoiced, 531_000.0);
        assert_eq!(first.paid, 531_000.0);
        assert_eq!(first.pending, 0.0);
        assert_eq!(first.profit_margin, 91.0);
    }

    #[test]
    fn billing_summary_groups_by_status() {
        let (_temp, store) = test_store();
        seed_demo_data(&store);
        let rows = billing_summary_rows(&store);
        assert_eq!(rows.len(), 4);
        let approved = rows
            .iter()
            .find(|row| row.status == BillStatus::Approved)
            .expect("approved row should be present");
        assert_eq!(approved.count, 2);
        assert_eq!(approved.amount, 4_950_000.0);
        let draft = rows
            .iter()
            .find(|row| row.status == BillStatus::Draft)
            .expect("draft row should be present");
        assert_eq!(draft.count, 0);
    }

    #[test]
    fn pending_payments_skip_paid_invoices() {
        let (_temp, store) = test_store();
        seed_demo_data(&store);
        let rows = pending_payment_rows(&store);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].invoice_number, "INV/2024/002");
        assert_eq!(rows[0].client_name, "Bangalore Infrastructure Ltd");
        assert_eq!(rows[0].days_overdue, 0);
    }

    #[test]
    fn overdue_invoices_report_days_overdue() {
        let (_temp, store) = test_store();
        let invoice = create_invoice(
            &store,
            &json!({
                "projectId": "proj_1",
                "clientId": "client_1",
                "invoiceNumber": "INV/2024/010",
                "billId": "bill_1",
                "dueDate": "2024-01-01",
                "amount": 1000,
            }),
        )
        .expect("create should succeed");
        update_invoice(&store, invoice.id.as_str(), &json!({ "status": "overdue" }))
            .expect("update should validate")
            .expect("record should exist");

        let rows = pending_payment_rows(&store);
        assert_eq!(rows.len(), 1);
        assert!(rows[0].days_overdue > 0);
    }

    #[test]
    fn csv_escape_handles_quotes_commas_and_newlines() {
        assert_eq!(csv_escape("plain"), "plain");
        assert_eq!(csv_escape("a,b"), "\"a,b\"");
        assert_eq!(csv_escape("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(csv_escape("line\nbreak"), "\"line\nbreak\"");
    }

    #[test]
    fn csv_neutralizes_formula_cells() {
        assert_eq!(neutralize_csv_formula("=SUM(A1)"), "'=SUM(A1)");
        assert_eq!(neutralize_csv_formula("+1"), "'+1");
        assert_eq!(neutralize_csv_formula("total"), "total");
        assert_eq!(neutralize_csv_formula("'=already"), "'=already");
    }

    #[test]
    fn export_filename_is_sanitized_to_csv() {
        assert_eq!(
            sanitize_export_filename("../../etc/passwd"),
            ".._.._etc_passwd.csv"
        );
        assert_eq!(sanitize_export_filename("projects"), "projects.csv");
        assert_eq!(sanitize_export_filename(""), "erpcivil-export.csv");
    }

    #[test]
    fn rows_to_csv_uses_union_of_columns() {
        let rows = vec![
            json!({ "id": "a", "name": "First" }),
            json!({ "id": "b", "name": "Second", "location": "Mumbai" }),
        ];
        let columns = collection_columns(rows.as_slice());
        assert_eq!(columns, vec!["id", "name", "location"]);

        let csv = rows_to_csv(columns.as_slice(), rows.as_slice());
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "id,name,location");
        assert_eq!(lines[1], "a,First,");
        assert_eq!(lines[2], "b,Second,Mumbai");
    }

    #[test]
    fn backup_round_trips_the_namespace() {
        let (_temp, store) = test_store();
        seed_demo_data(&store);
        let mut session = SessionState::default();
        session_login(&store, &mut session, UserRole::Admin);
        let backup = build_backup_value(&store);

        let (_other_temp, restored) = test_store();
        let applied = apply_backup_value(&restored, &backup).expect("restore should succeed");

        assert_eq!(applied, COLLECTIONS.len() + 1);
        assert_eq!(
            collection_all::<Project>(&restored),
            collection_all::<Project>(&store)
        );
        assert_eq!(
            restored.get_as::<User>(CURRENT_USER_KEY),
            store.get_as::<User>(CURRENT_USER_KEY)
        );
    }

    #[test]
    fn backup_with_wrong_shapes_is_rejected_before_clearing() {
        let (_temp, store) = test_store();
        seed_demo_data(&store);
        let err = apply_backup_value(&store, &json!({ "projects": "not-a-list" }))
            .expect_err("restore should fail");
        assert!(err.contains("projects"));
        assert_eq!(collection_all::<Project>(&store).len(), 4);
    }
}
