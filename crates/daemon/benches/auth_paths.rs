//! Performance benchmarks for the per-request hot paths.
//!
//! Every protected request pays for:
//! - Token verification
//! - Logical path cleaning and scope resolution
//! - Range header parsing on downloads

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use daemon::auth::TokenCodec;
use daemon::config::UserDefaults;
use daemon::files::scope::clean_logical;
use daemon::files::transfer::parse_range_header;
use daemon::files::{resolve_for, Operation};
use daemon::store::User;
use protocol::Permissions;
use tempfile::TempDir;

fn bench_tokens(c: &mut Criterion) {
    let mut group = c.benchmark_group("tokens");
    let codec = TokenCodec::new(b"bench-signing-key-0123456789abcdef").unwrap();
    let token = codec.issue(42).unwrap();

    group.bench_function("issue", |b| b.iter(|| codec.issue(black_box(42)).unwrap()));

    group.bench_function("verify_valid", |b| {
        b.iter(|| codec.verify(black_box(&token)))
    });

    let mut tampered = token.clone();
    tampered.push('x');
    group.bench_function("verify_tampered", |b| {
        b.iter(|| codec.verify(black_box(&tampered)))
    });

    group.finish();
}

fn bench_scope(c: &mut Criterion) {
    let mut group = c.benchmark_group("scope");

    let temp = TempDir::new().unwrap();
    let scope = temp.path().join("files");
    std::fs::create_dir_all(scope.join("docs/archive/2024")).unwrap();
    std::fs::write(scope.join("docs/archive/2024/report.pdf"), b"pdf").unwrap();

    let defaults = UserDefaults {
        scope,
        permissions: Permissions::all(),
        ..UserDefaults::default()
    };
    let user = User::from_defaults(&defaults, "bench", String::new());

    group.bench_function("clean_logical", |b| {
        b.iter(|| clean_logical(black_box("/docs/./archive//2024/../2024/report.pdf")))
    });

    group.bench_function("resolve_existing_file", |b| {
        b.iter(|| {
            resolve_for(
                &user,
                black_box("/docs/archive/2024/report.pdf"),
                Operation::Download,
            )
        })
    });

    group.bench_function("resolve_new_file", |b| {
        b.iter(|| resolve_for(&user, black_box("/docs/new/upload.bin"), Operation::Create))
    });

    group.bench_function("reject_traversal", |b| {
        b.iter(|| resolve_for(&user, black_box("/docs/../../etc/passwd"), Operation::List))
    });

    group.finish();
}

fn bench_range_parsing(c: &mut Criterion) {
    let mut group = c.benchmark_group("range_parsing");

    for (name, header) in [
        ("bounded", "bytes=1024-65535"),
        ("open_ended", "bytes=4096-"),
        ("suffix", "bytes=-500"),
        ("invalid", "items=0-1"),
    ] {
        group.bench_function(name, |b| {
            b.iter(|| parse_range_header(black_box(header), black_box(1 << 20)))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_tokens, bench_scope, bench_range_parsing);

criterion_main!(benches);
