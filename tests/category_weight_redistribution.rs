mod test_support;

use serde_json::{json, Value};
use test_support::{approx, f, open_workspace, Sidecar};

fn weights_in(sc: &mut Sidecar, subject_id: &str, category_id: &str) -> Vec<f64> {
    let res = sc.ok(
        "assessments.list",
        json!({ "subjectId": subject_id, "categoryId": category_id, "includePredictions": true }),
    );
    res["assessments"]
        .as_array()
        .expect("assessments")
        .iter()
        .map(|a| f(&a["weight"]))
        .collect()
}

fn category<'a>(list: &'a Value, id: &str) -> &'a Value {
    list["categories"]
        .as_array()
        .expect("categories")
        .iter()
        .find(|c| c["id"].as_str() == Some(id))
        .expect("category in list")
}

#[test]
fn adding_and_removing_items_resplits_the_category() {
    let (mut sc, workspace) = open_workspace("gradetrack-weights-split");
    let sid = sc.create_subject("English");
    let cid = sc.create_category(&sid, "Essays", 60.0);

    let list = sc.ok("categories.list", json!({ "subjectId": sid }));
    let c = category(&list, &cid);
    assert_eq!(c["itemCount"].as_i64(), Some(0));
    assert!(c["weightPerItem"].is_null());
    assert_eq!(c["weightDisplay"].as_str(), Some("N/A"));

    let preview = sc.ok(
        "categories.weightPreview",
        json!({ "subjectId": sid, "categoryId": cid }),
    );
    assert!(approx(f(&preview["weightPerItem"]), 60.0));

    let a1 = sc.add_assessment(&sid, &cid, "Essay 1", 1.0, Some(80.0));
    assert_eq!(weights_in(&mut sc, &sid, &cid), vec![60.0]);

    let a2 = sc.add_assessment(&sid, &cid, "Essay 2", 1.0, None);
    sc.add_prediction(&sid, &cid, "Essay 3", 2.0, 90.0);
    let w = weights_in(&mut sc, &sid, &cid);
    assert_eq!(w.len(), 3);
    assert!(w.iter().all(|x| approx(*x, 20.0)));
    assert!(approx(w.iter().sum::<f64>(), 60.0));

    let res = sc.ok("assessments.delete", json!({ "assessmentId": a2 }));
    assert!(approx(f(&res["weightPerItem"]), 30.0));
    assert!(weights_in(&mut sc, &sid, &cid)
        .iter()
        .all(|x| approx(*x, 30.0)));

    let res = sc.ok(
        "assessments.bulkDelete",
        json!({ "assessmentIds": [a1, "no-such-id"] }),
    );
    assert_eq!(res["deleted"].as_u64(), Some(1));
    assert_eq!(res["skipped"], json!(["no-such-id"]));
    assert!(res["summaries"].get(&sid).is_some());
    assert!(weights_in(&mut sc, &sid, &cid)
        .iter()
        .all(|x| approx(*x, 60.0)));

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn moving_an_item_recomputes_both_categories() {
    let (mut sc, workspace) = open_workspace("gradetrack-weights-move");
    let sid = sc.create_subject("Geography");
    let quizzes = sc.create_category(&sid, "Quizzes", 30.0);
    let tests = sc.create_category(&sid, "Tests", 70.0);

    let q1 = sc.add_assessment(&sid, &quizzes, "Quiz 1", 1.0, Some(70.0));
    sc.add_assessment(&sid, &quizzes, "Quiz 2", 1.0, Some(75.0));
    sc.add_assessment(&sid, &quizzes, "Quiz 3", 1.0, Some(80.0));
    sc.add_assessment(&sid, &tests, "Test 1", 4.0, Some(85.0));

    let preview = sc.ok(
        "categories.weightPreview",
        json!({ "subjectId": sid, "categoryId": tests, "assessmentId": q1 }),
    );
    assert_eq!(preview["itemCount"].as_u64(), Some(2));
    assert!(approx(f(&preview["weightPerItem"]), 35.0));

    let res = sc.ok(
        "assessments.update",
        json!({ "assessmentId": q1, "patch": { "categoryId": tests } }),
    );
    assert_eq!(res["movedFromCategoryId"].as_str(), Some(quizzes.as_str()));
    assert!(approx(f(&res["assessment"]["weight"]), 35.0));

    assert!(weights_in(&mut sc, &sid, &quizzes)
        .iter()
        .all(|x| approx(*x, 15.0)));
    assert!(weights_in(&mut sc, &sid, &tests)
        .iter()
        .all(|x| approx(*x, 35.0)));

    // Summary in the mutation response reflects the post-move state.
    let summary = &res["summary"];
    assert!(approx(f(&summary["total_weight"]), 100.0));
    let expected = (75.0 * 15.0 + 80.0 * 15.0 + 70.0 * 35.0 + 85.0 * 35.0) / 100.0;
    assert!(approx(f(&summary["average_grade"]), expected));

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn changing_total_weight_updates_members_and_advisory() {
    let (mut sc, workspace) = open_workspace("gradetrack-weights-total");
    let sid = sc.create_subject("Music");
    let theory = sc.create_category(&sid, "Theory", 40.0);
    let created = sc.ok(
        "categories.create",
        json!({ "subjectId": sid, "name": "Performance", "totalWeight": 50.0 }),
    );
    assert_eq!(created["advisory"]["balanced"].as_bool(), Some(false));
    assert!(approx(f(&created["advisory"]["remainingWeight"]), 10.0));
    assert!(created["advisory"]["warning"].is_string());

    sc.add_assessment(&sid, &theory, "Theory 1", 1.0, Some(90.0));
    sc.add_assessment(&sid, &theory, "Theory 2", 1.0, Some(80.0));

    let res = sc.ok(
        "categories.update",
        json!({ "subjectId": sid, "categoryId": theory, "patch": { "totalWeight": 50.0 } }),
    );
    assert!(approx(f(&res["weightPerItem"]), 25.0));
    assert_eq!(res["advisory"]["balanced"].as_bool(), Some(true));
    assert!(res["advisory"]["warning"].is_null());
    assert!(approx(f(&res["summary"]["total_weight"]), 50.0));

    let list = sc.ok("categories.list", json!({ "subjectId": sid }));
    assert!(approx(f(&list["advisory"]["totalWeight"]), 100.0));
    let c = category(&list, &theory);
    assert_eq!(c["weightDisplay"].as_str(), Some("25"));

    let code = sc.err(
        "categories.update",
        json!({ "subjectId": sid, "categoryId": theory, "patch": { "totalWeight": -1 } }),
    );
    assert_eq!(code, "bad_params");

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn category_weight_is_pure_and_guards_zero() {
    let (mut sc, workspace) = open_workspace("gradetrack-weights-pure");
    let r = sc.ok(
        "calc.categoryWeight",
        json!({ "totalWeight": 45.0, "itemCount": 3 }),
    );
    assert!(approx(f(&r["weightPerItem"]), 15.0));

    let zero = sc.ok(
        "calc.categoryWeight",
        json!({ "totalWeight": 45.0, "itemCount": 0 }),
    );
    assert_eq!(f(&zero["weightPerItem"]), 0.0);
    assert_eq!(zero["weightDisplay"].as_str(), Some("N/A"));

    let code = sc.err(
        "calc.categoryWeight",
        json!({ "totalWeight": 45.0, "itemCount": -2 }),
    );
    assert_eq!(code, "bad_params");

    let _ = std::fs::remove_dir_all(workspace);
}
