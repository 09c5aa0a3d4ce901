use super::{format_migration_row, outcome_message, version_list, Palette};
use crate::app::MigrationView;
use cardmig::MigrationResult;

fn plain() -> Palette {
    Palette { enabled: false }
}

fn view(version: u32, loadable: bool, applied: bool) -> MigrationView {
    MigrationView {
        version,
        description: Some("split labels".to_string()),
        path: Some(format!("/p/.cards/migrations/{version}")),
        loadable,
        applied,
    }
}

#[test]
fn migration_rows_mark_state() {
    let palette = plain();
    assert_eq!(
        format_migration_row(&view(2, true, true), &palette),
        "v2 [APPLIED] split labels /p/.cards/migrations/2"
    );
    assert_eq!(
        format_migration_row(&view(3, true, false), &palette),
        "v3 [PENDING] split labels /p/.cards/migrations/3"
    );
    let mut broken = view(4, false, false);
    broken.description = None;
    broken.path = None;
    assert_eq!(format_migration_row(&broken, &palette), "v4 [BROKEN]");
}

#[test]
fn palette_paints_only_when_enabled() {
    let painted = Palette { enabled: true };
    assert_eq!(painted.ok("done"), "\x1b[32mdone\x1b[0m");
    assert_eq!(plain().ok("done"), "done");
}

#[test]
fn version_list_joins_with_prefix() {
    assert_eq!(version_list(&[2, 3, 10]), "v2, v3, v10");
    assert_eq!(version_list(&[]), "");
}

#[test]
fn outcome_message_falls_back_when_missing() {
    let failed = MigrationResult {
        success: false,
        message: None,
        steps_executed: Vec::new(),
        final_version: 1,
    };
    assert_eq!(outcome_message(&failed), "migration failed");
    let done = MigrationResult::succeeded(Some("Migrated".to_string()), Vec::new(), 2);
    assert_eq!(outcome_message(&done), "Migrated");
}
