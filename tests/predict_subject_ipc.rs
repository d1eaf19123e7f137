mod test_support;

use serde_json::json;
use test_support::{approx, f, open_workspace};

#[test]
fn target_mode_reports_needed_average_on_remaining_weight() {
    let (mut sc, workspace) = open_workspace("gradetrack-predict-subject-target");
    let sid = sc.create_subject("Calculus");
    let hw = sc.create_category(&sid, "Homework", 20.0);
    let exams = sc.create_category(&sid, "Exams", 80.0);
    sc.add_assessment(&sid, &hw, "HW 1", 2.0, Some(90.0));
    sc.add_assessment(&sid, &hw, "HW 2", 4.0, Some(80.0));
    // 20% graded at 85 => weighted sum 1700; 80% remains.
    sc.add_assessment(&sid, &exams, "Final", 0.0, None);

    let res = sc.ok(
        "predict.subject",
        json!({ "subjectId": sid, "targetGrade": 75.0 }),
    );
    assert_eq!(res["mode"].as_str(), Some("target_grade"));
    assert!(approx(f(&res["remaining_weight"]), 80.0));
    assert!(approx(f(&res["current_average"]), 85.0));
    assert!(approx(f(&res["current_weighted_sum"]), 1700.0));
    assert!(approx(f(&res["average_grade_needed"]), 72.5));
    assert!(res["predicted_additional_time"].as_f64().expect("hours") > 0.0);

    let unreachable = sc.ok(
        "predict.subject",
        json!({ "subjectId": sid, "targetGrade": 99.0 }),
    );
    assert!(unreachable["average_grade_needed"].is_null());
    assert!(unreachable["message"].as_str().unwrap_or("").contains("unreachable"));

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn fully_graded_subject_has_nothing_left() {
    let (mut sc, workspace) = open_workspace("gradetrack-predict-subject-done");
    let sid = sc.create_subject("Art");
    let cid = sc.create_category(&sid, "Portfolio", 100.0);
    sc.add_assessment(&sid, &cid, "Portfolio", 12.0, Some(88.0));

    let res = sc.ok(
        "predict.subject",
        json!({ "subjectId": sid, "targetGrade": 90.0 }),
    );
    assert_eq!(f(&res["remaining_weight"]), 0.0);
    assert!(res["average_grade_needed"].is_null());
    assert!(res["message"].is_string());

    let res = sc.ok(
        "predict.subject",
        json!({ "subjectId": sid, "studyTime": 3.0 }),
    );
    assert!(approx(f(&res["predicted_overall_grade"]), 88.0));
    assert!(approx(f(&res["predicted_additional_time"]), 3.0));

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn already_at_target_needs_nothing_more() {
    let (mut sc, workspace) = open_workspace("gradetrack-predict-subject-at-target");
    let sid = sc.create_subject("Music");
    let cid = sc.create_category(&sid, "Recitals", 50.0);
    sc.create_category(&sid, "Theory", 50.0);
    sc.add_assessment(&sid, &cid, "Recital 1", 5.0, Some(80.0));

    // 80 over 50% => 40 overall already banked.
    let res = sc.ok(
        "predict.subject",
        json!({ "subjectId": sid, "targetGrade": 40.0 }),
    );
    let needed = f(&res["average_grade_needed"]);
    assert!(needed <= 40.0);
    assert!(approx(needed, 0.0));

    let below = sc.ok(
        "predict.subject",
        json!({ "subjectId": sid, "targetGrade": 30.0 }),
    );
    assert!(below["average_grade_needed"].is_null());
    assert!(below["message"].as_str().unwrap_or("").contains("secured"));

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn study_time_mode_projects_and_validates() {
    let (mut sc, workspace) = open_workspace("gradetrack-predict-subject-time");
    let sid = sc.create_subject("Physics");
    let labs = sc.create_category(&sid, "Labs", 40.0);
    sc.add_assessment(&sid, &labs, "Lab 1", 2.0, Some(70.0));
    sc.add_assessment(&sid, &labs, "Lab 2", 4.0, Some(85.0));

    let low = sc.ok(
        "predict.subject",
        json!({ "subjectId": sid, "studyTime": 1.0 }),
    );
    let high = sc.ok(
        "predict.subject",
        json!({ "subjectId": sid, "studyTime": 30.0 }),
    );
    assert_eq!(low["mode"].as_str(), Some("study_time"));
    assert!(f(&high["predicted_overall_grade"]) > f(&low["predicted_overall_grade"]));
    assert!(f(&high["predicted_overall_grade"]) <= 100.0);

    assert_eq!(
        sc.err(
            "predict.subject",
            json!({ "subjectId": sid, "studyTime": 2.0, "targetGrade": 80.0 })
        ),
        "bad_params"
    );
    assert_eq!(
        sc.err("predict.subject", json!({ "subjectId": sid })),
        "bad_params"
    );
    assert_eq!(
        sc.err(
            "predict.subject",
            json!({ "subjectId": sid, "studyTime": -2.0 })
        ),
        "bad_params"
    );
    assert_eq!(
        sc.err("predict.subject", json!({ "studyTime": 2.0 })),
        "bad_params"
    );

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn no_history_means_insufficient_data() {
    let (mut sc, workspace) = open_workspace("gradetrack-predict-subject-empty");
    let sid = sc.create_subject("Latin");
    sc.create_category(&sid, "Translations", 100.0);

    let res = sc.ok(
        "predict.subject",
        json!({ "subjectId": sid, "studyTime": 4.0 }),
    );
    assert!(res["predicted_overall_grade"].is_null());
    assert!(res["message"].is_string());
    assert!(approx(f(&res["remaining_weight"]), 100.0));

    let _ = std::fs::remove_dir_all(workspace);
}
