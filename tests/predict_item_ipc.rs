mod test_support;

use serde_json::json;
use test_support::{f, open_workspace, Sidecar};

/// Subject with one 60% category holding three graded items (20 each):
/// (2h, 70), (4h, 85), (6h, 95).
fn seeded(sc: &mut Sidecar) -> (String, String) {
    let sid = sc.create_subject("Chemistry");
    let cid = sc.create_category(&sid, "Tests", 60.0);
    sc.add_assessment(&sid, &cid, "Test 1", 2.0, Some(70.0));
    sc.add_assessment(&sid, &cid, "Test 2", 4.0, Some(85.0));
    sc.add_assessment(&sid, &cid, "Test 3", 6.0, Some(95.0));
    (sid, cid)
}

#[test]
fn grade_from_hours_stays_inside_history_and_grows_with_hours() {
    let (mut sc, workspace) = open_workspace("gradetrack-predict-item-hours");
    let (sid, cid) = seeded(&mut sc);

    let res = sc.ok(
        "predict.item",
        json!({ "subjectId": sid, "categoryId": cid, "weight": 20.0, "hours": 5.0 }),
    );
    assert_eq!(res["mode"].as_str(), Some("grade_from_hours"));
    assert_eq!(res["scope"].as_str(), Some("category"));
    assert_eq!(res["historyCount"].as_u64(), Some(3));
    let g = f(&res["predicted_grade"]);
    assert!((70.0..=95.0).contains(&g), "got {}", g);

    let mut last = 0.0;
    for hours in [1.0, 3.0, 5.0, 8.0, 20.0] {
        let r = sc.ok(
            "predict.item",
            json!({ "subjectId": sid, "categoryId": cid, "weight": 20.0, "hours": hours }),
        );
        let g = f(&r["predicted_grade"]);
        assert!(g >= last, "{} < {} at {}h", g, last, hours);
        assert!(g <= 100.0);
        last = g;
    }

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn hours_from_grade_and_unreachable_target() {
    let (mut sc, workspace) = open_workspace("gradetrack-predict-item-target");
    let (sid, cid) = seeded(&mut sc);

    let res = sc.ok(
        "predict.item",
        json!({ "subjectId": sid, "categoryId": cid, "weight": 20.0, "targetGrade": 85.0 }),
    );
    assert_eq!(res["mode"].as_str(), Some("hours_from_grade"));
    let h = f(&res["required_hours"]);
    assert!(h > 2.0 && h < 6.0, "got {}", h);

    let res = sc.ok(
        "predict.item",
        json!({ "subjectId": sid, "categoryId": cid, "weight": 20.0, "targetGrade": 100.0 }),
    );
    assert!(res["required_hours"].is_null());
    assert!(res["message"].is_string());

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn input_validation_errors() {
    let (mut sc, workspace) = open_workspace("gradetrack-predict-item-validate");
    let (sid, cid) = seeded(&mut sc);

    let both = sc.err(
        "predict.item",
        json!({ "subjectId": sid, "categoryId": cid, "weight": 10.0, "hours": 3.0, "targetGrade": 80.0 }),
    );
    assert_eq!(both, "bad_params");
    let neither = sc.err(
        "predict.item",
        json!({ "subjectId": sid, "categoryId": cid, "weight": 10.0 }),
    );
    assert_eq!(neither, "bad_params");
    let negative = sc.err(
        "predict.item",
        json!({ "subjectId": sid, "categoryId": cid, "weight": -5.0, "hours": 3.0 }),
    );
    assert_eq!(negative, "bad_params");
    let negative_hours = sc.err(
        "predict.item",
        json!({ "subjectId": sid, "categoryId": cid, "hours": -1.0 }),
    );
    assert_eq!(negative_hours, "bad_params");
    let no_category = sc.err("predict.item", json!({ "subjectId": sid, "hours": 3.0 }));
    assert_eq!(no_category, "bad_params");
    let no_subject = sc.err("predict.item", json!({ "categoryId": cid, "hours": 3.0 }));
    assert_eq!(no_subject, "bad_params");

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn empty_category_falls_back_to_subject_history() {
    let (mut sc, workspace) = open_workspace("gradetrack-predict-item-fallback");
    let (sid, _tests) = seeded(&mut sc);
    let fresh = sc.create_category(&sid, "Projects", 40.0);

    let res = sc.ok(
        "predict.item",
        json!({ "subjectId": sid, "categoryId": fresh, "hours": 5.0 }),
    );
    assert_eq!(res["scope"].as_str(), Some("subject"));
    assert!(res["predicted_grade"].is_number());
    // Default weight is the whole empty category.
    assert_eq!(res["weight"].as_f64(), Some(40.0));

    let _ = sc.ok(
        "setup.update",
        json!({ "section": "prediction", "patch": { "fallbackToSubjectHistory": false } }),
    );
    let res = sc.ok(
        "predict.item",
        json!({ "subjectId": sid, "categoryId": fresh, "hours": 5.0 }),
    );
    assert_eq!(res["scope"].as_str(), Some("category"));
    assert!(res["predicted_grade"].is_null());
    assert!(res["message"].is_string());

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn predicted_item_is_excluded_from_its_own_history() {
    let (mut sc, workspace) = open_workspace("gradetrack-predict-item-exclude");
    let sid = sc.create_subject("Biology");
    let cid = sc.create_category(&sid, "Quizzes", 20.0);
    let only = sc.add_assessment(&sid, &cid, "Quiz 1", 2.0, Some(80.0));

    let _ = sc.ok(
        "setup.update",
        json!({ "section": "prediction", "patch": { "fallbackToSubjectHistory": false } }),
    );
    let res = sc.ok(
        "predict.item",
        json!({ "subjectId": sid, "categoryId": cid, "assessmentId": only, "hours": 2.0 }),
    );
    assert_eq!(res["historyCount"].as_u64(), Some(0));
    assert!(res["predicted_grade"].is_null());

    let _ = std::fs::remove_dir_all(workspace);
}
