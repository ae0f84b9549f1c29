//! Benchmarks for core custody-ledger operations.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use uuid::Uuid;

use pharmatrail_core::{
    batch,
    ledger::{self, CreateBatch, TransferKind, TransferRequest},
    medicine::{self, NewMedicine},
    party::{self, Actor, NewParty, Role},
    store::{Store, DEFAULT_BUSY_TIMEOUT_MS},
    util,
    verify::extract_code,
};

fn bench_extract_code(c: &mut Criterion) {
    let payload = serde_json::json!({
        "schema": "pharmatrail.label.v1",
        "code": "RX-0123456789abcdef0123456789abcdef",
        "batch_number": "BENCH-2026-001",
        "medicine": "Benchazol 100mg",
        "drug_code": "BNZ-100",
        "manufacture_date": "2026-01-01",
        "expiry_date": "2028-01-01",
    })
    .to_string();

    c.bench_function("extract_code_label", |b| {
        b.iter(|| extract_code(black_box(&payload)))
    });
}

fn bench_sha256(c: &mut Criterion) {
    let data = vec![0u8; 1024];
    c.bench_function("sha256_1kb", |b| {
        b.iter(|| util::sha256(black_box(&data)))
    });
}

fn bench_generate_code(c: &mut Criterion) {
    c.bench_function("generate_code", |b| b.iter(batch::generate_code));
}

fn seeded_store(db_path: &std::path::Path, quantity: u32) -> (Store, Actor, Uuid) {
    let mut store = Store::create_new(db_path, DEFAULT_BUSY_TIMEOUT_MS).unwrap();
    let mfg = party::register_party(
        &mut store,
        NewParty {
            name: "Bench Pharma".into(),
            role: Role::Manufacturer,
            company: None,
            license_no: None,
            contact: None,
        },
    )
    .unwrap();
    let shop = party::register_party(
        &mut store,
        NewParty {
            name: "Bench Pharmacy".into(),
            role: Role::Retailer,
            company: None,
            license_no: None,
            contact: None,
        },
    )
    .unwrap();
    let mfg = Actor::from(&mfg);
    let shop = Actor::from(&shop);

    let med = medicine::add_medicine(
        &mut store,
        mfg,
        NewMedicine {
            name: "Benchazol 100mg".into(),
            drug_code: "BNZ-100".into(),
            composition: "Benchazol 100mg".into(),
            dosage: "1 tablet daily".into(),
            shelf_life_months: 24,
        },
    )
    .unwrap();
    let batch = ledger::create_batch(
        &mut store,
        mfg,
        CreateBatch {
            medicine_id: med.id,
            batch_number: "BENCH-2026-001".into(),
            manufacture_date: "2026-01-01".into(),
            expiry_date: "2028-01-01".into(),
            quantity,
        },
    )
    .unwrap();
    ledger::transfer(
        &mut store,
        mfg,
        TransferRequest {
            batch_id: batch.id,
            to_party_id: shop.id,
            quantity: quantity / 2,
            kind: TransferKind::Shipment,
            notes: None,
        },
    )
    .unwrap();
    (store, shop, batch.id)
}

fn bench_sale_append(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    // Half of two billion units stays with the retailer, so the bench never
    // drains the batch.
    let (mut store, shop, batch_id) = seeded_store(&dir.path().join("bench.db"), 2_000_000_000);

    c.bench_function("sale_append", |b| {
        b.iter(|| ledger::record_sale(&mut store, shop, black_box(batch_id), 1, None).unwrap())
    });
}

fn bench_audit(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let (mut store, shop, batch_id) = seeded_store(&dir.path().join("bench_audit.db"), 100);
    for _ in 0..50 {
        ledger::record_sale(&mut store, shop, batch_id, 1, None).unwrap();
    }

    c.bench_function("audit_chain", |b| {
        b.iter(|| ledger::audit(&mut store).unwrap())
    });
}

criterion_group!(
    benches,
    bench_extract_code,
    bench_sha256,
    bench_generate_code,
    bench_sale_append,
    bench_audit,
);
criterion_main!(benches);
