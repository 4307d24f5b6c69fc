//! MediChain demo scenario
//!
//! Runs the full sharing lifecycle against the in-memory ledger and
//! content store: registration, write grants, encrypted records, a
//! request/approve round with a narrowed disclosure bundle, and both
//! emergency paths.
//!
//! ## Usage
//!
//! ```bash
//! # Run with defaults
//! medichain
//!
//! # Verbose engine logging
//! medichain --log-level medichain=debug
//!
//! # Heavier key derivation
//! medichain --kdf-iterations 310000
//! ```

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use medichain::emergency::{encode_qr, EmergencyCache, EmergencyContact};
use medichain::{
    AccessControlEngine, Address, DisclosurePackager, EmergencyProfile, EmergencyService, Ledger,
    MedichainConfig, MemoryContentStore, MemoryLedger, RecordId, RecordStore,
};

#[derive(Parser, Debug)]
#[command(name = "medichain")]
#[command(about = "Patient-controlled medical record sharing demo")]
struct Args {
    /// Log level filter (e.g. info, medichain=debug)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// PBKDF2 iteration count for key derivation
    #[arg(long, env = "MEDICHAIN_KDF_ITERATIONS")]
    kdf_iterations: Option<u32>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&args.log_level).context("invalid log level")?)
        .init();

    let mut config = MedichainConfig::from_env();
    if let Some(iterations) = args.kdf_iterations {
        config.kdf_iterations = iterations;
    }
    config.validate().map_err(anyhow::Error::msg)?;

    let ledger = Arc::new(MemoryLedger::new());
    let content = Arc::new(MemoryContentStore::new());
    let engine = Arc::new(AccessControlEngine::new(ledger.clone()));
    let records = Arc::new(RecordStore::new(ledger.clone(), content.clone()));
    let keys = config.key_deriver();
    let packager = DisclosurePackager::new(
        ledger.clone(),
        engine.clone(),
        records.clone(),
        content.clone(),
        keys.clone(),
    );
    let emergency = EmergencyService::new(
        engine.clone(),
        content.clone(),
        keys.clone(),
        EmergencyCache::new(config.emergency_cache_config()),
    );

    let patient = Address::new("0x3f9d2ab04c71e8f6905b1d3a7e2c4f8a6b0d9e15");
    let provider = Address::new("0x84c1f0b7d2a9563e8f4071c6b5d903a2e7f8c410");
    let doctor = Address::new("0xa25e8d904b16f3c7082a9e5d1c4b6f37d08e92ba");

    // Patient onboarding
    engine.register_patient(&patient).await?;
    engine.grant_access(&patient, &provider).await?;

    // The provider writes two encrypted records
    let patient_key = keys.derive_key(patient.as_str());
    let blood_panel = RecordId::new("rec-blood-panel-2025");
    let imaging = RecordId::new("rec-chest-ct-2025");

    let now = ledger.now().await?;
    let cid = records
        .put_payload(
            &json!({"type": "lab", "panel": "CBC", "hemoglobin": 13.2}),
            &patient_key,
        )
        .await?;
    records
        .add_record(&provider, &patient, &blood_panel, cid, now)
        .await?;

    let cid = records
        .put_payload(
            &json!({"type": "imaging", "modality": "CT", "impression": "unremarkable"}),
            &patient_key,
        )
        .await?;
    records
        .add_record(&provider, &patient, &imaging, cid, now)
        .await?;

    // A corrected lab result bumps the version
    let cid = records
        .put_payload(
            &json!({"type": "lab", "panel": "CBC", "hemoglobin": 13.4, "corrected": true}),
            &patient_key,
        )
        .await?;
    records
        .update_record(&provider, &patient, &blood_panel, cid)
        .await?;

    // A second doctor asks for both records; the patient shares only one
    let request_id = engine
        .request_access(
            &doctor,
            &patient,
            vec![blood_panel.clone(), imaging.clone()],
            "cardiology consult",
            86_400,
        )
        .await?;
    info!(request_id = %request_id, "Doctor filed an access request");

    let pending = engine.get_pending_requests(&patient).await?;
    info!(pending = pending.len(), "Patient reviews pending requests");

    let outcome = packager
        .approve_request(&patient, &request_id, &[blood_panel.clone()])
        .await?;
    info!(shared_cid = %outcome.shared_cid, "Patient approved a narrowed subset");

    // The doctor reads the shared copy
    let bundle = packager.open_bundle(&doctor, &patient).await?;
    let disclosed = bundle
        .record(&blood_panel)
        .context("approved record missing from bundle")?;
    info!(
        record_id = %disclosed.record_id,
        version = disclosed.metadata.version,
        hemoglobin = %disclosed.data["hemoglobin"],
        "Doctor read the disclosed record"
    );
    info!(
        imaging_visible = engine.has_doctor_access(&patient, &doctor, &imaging).await?,
        "Undisclosed records stay closed"
    );

    // Emergency profile, both paths
    let profile = EmergencyProfile {
        patient: patient.clone(),
        blood_type: "O-".into(),
        allergies: vec!["penicillin".into()],
        conditions: vec!["type 1 diabetes".into()],
        medications: vec!["insulin".into()],
        contacts: vec![EmergencyContact {
            name: "Dana Reyes".into(),
            phone: "+1-555-0100".into(),
            relation: "spouse".into(),
        }],
        organ_donor: true,
        dnr_order: false,
        notes: "insulin pump on left side".into(),
        last_updated: chrono::Utc::now().to_rfc3339(),
    };

    engine.set_emergency_access(&patient, true).await?;
    emergency.publish(&patient, &profile).await?;
    let fast_cid = emergency.publish_fast_path(&patient, &profile).await?;

    let loaded = emergency.load(&patient).await?;
    info!(blood_type = %loaded.blood_type, "Responder resolved the provider path");

    let offline = emergency.load_fast_path(&patient, &fast_cid).await?;
    info!(blood_type = %offline.blood_type, "Responder resolved the fast path");

    println!("\nEmergency QR payload:\n{}", encode_qr(&profile)?);
    Ok(())
}
