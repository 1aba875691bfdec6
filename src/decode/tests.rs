use std::sync::Arc;

use csv::StringRecord;

use super::*;

fn row(headers: &[&str], values: &[&str]) -> RawRow {
    RawRow::new(
        2,
        Arc::new(StringRecord::from(headers.to_vec())),
        StringRecord::from(values.to_vec()),
    )
}

fn decoder() -> FieldDecoder {
    FieldDecoder::new().expect("decoder builds")
}

fn expect_decoded(outcome: DecodeOutcome) -> Staged {
    match outcome {
        DecodeOutcome::Decoded(staged) => staged,
        DecodeOutcome::Rejected { reason, .. } => panic!("unexpected rejection: {reason}"),
    }
}

const MOVIE_HEADERS: [&str; 8] = [
    "id",
    "title",
    "budget",
    "release_date",
    "genres",
    "production_companies",
    "belongs_to_collection",
    "adult",
];

#[test]
fn movie_with_unparsable_id_is_rejected() {
    for bad_id in ["1997-08-20", "", "nan", "-3"] {
        let outcome = decoder().decode(
            Dataset::Movies,
            row(&MOVIE_HEADERS, &[bad_id, "A", "0", "", "[]", "[]", "", "False"]),
        );
        match outcome {
            DecodeOutcome::Rejected { reason, raw } => {
                assert!(matches!(
                    reason,
                    RejectReason::InvalidField { column: "id", .. }
                        | RejectReason::MissingField { column: "id" }
                ));
                assert_eq!(raw.get("title"), Some("A"));
            }
            DecodeOutcome::Decoded(_) => panic!("id {bad_id:?} should be rejected"),
        }
    }
}

#[test]
fn movie_with_broken_genres_still_decodes_without_children() {
    for genres in ["", "nan", "[{'id': 16, 'name'"] {
        let staged = expect_decoded(decoder().decode(
            Dataset::Movies,
            row(&MOVIE_HEADERS, &["862", "Toy Story", "30000000", "1995-10-30", genres, "", "", "False"]),
        ));

        assert_eq!(staged.parent.movie_id(), 862);
        assert!(
            staged
                .children
                .iter()
                .all(|child| !matches!(child.entity, NestedEntity::Genre { .. })),
            "genres {genres:?} must produce no genre children"
        );
    }
}

#[test]
fn movie_scalars_and_children_decode() {
    let staged = expect_decoded(decoder().decode(
        Dataset::Movies,
        row(
            &MOVIE_HEADERS,
            &[
                "862",
                "Toy Story",
                "30000000",
                "not a date",
                "[{'id': 16, 'name': 'Animation'}]",
                "[{'name': 'Pixar Animation Studios', 'id': 3}]",
                "{'id': 10194, 'name': 'Toy Story Collection'}",
                "True",
            ],
        ),
    ));

    let StagingParent::Movie(movie) = &staged.parent else {
        panic!("expected movie parent");
    };
    assert_eq!(movie.title.as_deref(), Some("Toy Story"));
    assert_eq!(movie.budget, Some(30_000_000));
    assert_eq!(movie.release_date, None);
    assert!(movie.adult);
    assert_eq!(movie.runtime, None);

    assert_eq!(staged.children.len(), 3);
    assert!(staged.children.iter().all(|child| child.movie_id == 862));
    assert!(matches!(
        staged.children[2].entity,
        NestedEntity::Collection { id: 10194, .. }
    ));
}

#[test]
fn movie_id_column_alias_is_honoured() {
    let staged = expect_decoded(decoder().decode(
        Dataset::Movies,
        row(&["movie_id", "title", "genres"], &["1", "A", r#"[{"id":1,"name":"Drama"}]"#]),
    ));
    assert_eq!(staged.parent.movie_id(), 1);
    assert_eq!(staged.children.len(), 1);
}

#[test]
fn credits_decode_cast_then_crew_with_their_own_ordinals() {
    let staged = expect_decoded(decoder().decode(
        Dataset::Credits,
        row(
            &["cast", "crew", "id"],
            &[
                "[{'id': 31, 'name': 'Tom Hanks', 'character': 'Woody', 'order': 0}, {'id': 12898, 'name': 'Tim Allen', 'character': 'Buzz', 'order': 1}]",
                "[{'id': 7879, 'name': 'John Lasseter', 'department': 'Directing', 'job': 'Director'}]",
                "862",
            ],
        ),
    ));

    assert_eq!(staged.parent, StagingParent::CreditSet { movie_id: 862 });
    let ordinals: Vec<usize> = staged.children.iter().map(|child| child.ordinal).collect();
    assert_eq!(ordinals, vec![0, 1, 0]);
    assert!(matches!(
        staged.children[2].entity,
        NestedEntity::CrewMember { person_id: 7879, .. }
    ));
}

#[test]
fn keywords_with_invalid_json_yield_no_children() {
    let staged = expect_decoded(decoder().decode(
        Dataset::Keywords,
        row(&["id", "keywords"], &["862", "[{'id': 931, 'name': 'jealousy'"]),
    ));
    assert!(staged.children.is_empty());
}

#[test]
fn ratings_outside_the_scale_are_rejected() {
    let headers = ["userId", "movieId", "rating", "timestamp"];

    let ok = decoder().decode(Dataset::Ratings, row(&headers, &["1", "31", "2.5", "1260759144"]));
    assert!(matches!(ok, DecodeOutcome::Decoded(_)));

    for (value, expected_range) in [("7.0", true), ("0", true), ("abc", false), ("", false)] {
        let outcome = decoder().decode(
            Dataset::Ratings,
            row(&headers, &["1", "31", value, "1260759144"]),
        );
        let DecodeOutcome::Rejected { reason, .. } = outcome else {
            panic!("rating {value:?} should be rejected");
        };
        assert_eq!(
            matches!(reason, RejectReason::OutOfRange { column: "rating", .. }),
            expected_range,
            "unexpected reason for {value:?}: {reason}"
        );
    }
}

#[test]
fn rating_without_timestamp_is_rejected() {
    let outcome = decoder().decode(
        Dataset::Ratings,
        row(&["userId", "movieId", "rating", "timestamp"], &["1", "31", "2.5", "yesterday"]),
    );
    assert!(matches!(
        outcome,
        DecodeOutcome::Rejected {
            reason: RejectReason::InvalidField { column: "timestamp", .. },
            ..
        }
    ));
}

#[test]
fn links_normalize_imdb_ids_and_tolerate_missing_tmdb() {
    let staged = expect_decoded(decoder().decode(
        Dataset::Links,
        row(&["movieId", "imdbId", "tmdbId"], &["1", "114709", ""]),
    ));
    assert_eq!(
        staged.parent,
        StagingParent::Link(LinkStaging {
            movie_id: 1,
            imdb_id: Some("tt0114709".to_string()),
            tmdb_id: None,
        })
    );

    let decoder = decoder();
    assert_eq!(decoder.normalize_imdb_id("tt0113497").as_deref(), Some("tt0113497"));
    assert_eq!(decoder.normalize_imdb_id("garbage"), None);
}
