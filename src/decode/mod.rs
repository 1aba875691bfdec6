mod nested;
mod scalar;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use regex::Regex;

use crate::error::RejectReason;
use crate::model::Dataset;
use crate::schema::columns;
use crate::source::RawRow;

use nested::{NestedShape, decode_list, decode_single};

pub use nested::NestedEntity;

pub const RATING_MIN: f64 = 0.5;
pub const RATING_MAX: f64 = 5.0;

#[derive(Debug, Clone, PartialEq)]
pub struct MovieStaging {
    pub id: i64,
    pub title: Option<String>,
    pub original_title: Option<String>,
    pub original_language: Option<String>,
    pub overview: Option<String>,
    pub tagline: Option<String>,
    pub status: Option<String>,
    pub homepage: Option<String>,
    pub imdb_id: Option<String>,
    pub poster_path: Option<String>,
    pub adult: bool,
    pub video: bool,
    pub budget: Option<i64>,
    pub revenue: Option<i64>,
    pub runtime: Option<f64>,
    pub popularity: Option<f64>,
    pub vote_average: Option<f64>,
    pub vote_count: Option<i64>,
    pub release_date: Option<NaiveDate>,
    pub production_countries: Option<String>,
    pub spoken_languages: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RatingStaging {
    pub user_id: i64,
    pub movie_id: i64,
    pub rating: f64,
    pub rated_at: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LinkStaging {
    pub movie_id: i64,
    pub imdb_id: Option<String>,
    pub tmdb_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StagingParent {
    Movie(MovieStaging),
    CreditSet { movie_id: i64 },
    KeywordSet { movie_id: i64 },
    Rating(RatingStaging),
    Link(LinkStaging),
}

impl StagingParent {
    pub fn movie_id(&self) -> i64 {
        match self {
            StagingParent::Movie(movie) => movie.id,
            StagingParent::CreditSet { movie_id } | StagingParent::KeywordSet { movie_id } => {
                *movie_id
            }
            StagingParent::Rating(rating) => rating.movie_id,
            StagingParent::Link(link) => link.movie_id,
        }
    }
}

/// A nested element tied back to the row it was decoded from.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildRecord {
    pub movie_id: i64,
    pub ordinal: usize,
    pub entity: NestedEntity,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Staged {
    pub parent: StagingParent,
    pub children: Vec<ChildRecord>,
    pub dropped_elements: usize,
}

#[derive(Debug, Clone)]
pub enum DecodeOutcome {
    Decoded(Staged),
    Rejected { reason: RejectReason, raw: RawRow },
}

/// Holds the compiled patterns the decoders need so a dataset load compiles
/// them once.
pub struct FieldDecoder {
    imdb_pattern: Regex,
}

impl FieldDecoder {
    pub fn new() -> Result<Self> {
        let imdb_pattern =
            Regex::new(r"^(?:tt)?0*(\d{1,10})$").context("failed to compile imdb id regex")?;
        Ok(Self { imdb_pattern })
    }

    pub fn decode(&self, dataset: Dataset, row: RawRow) -> DecodeOutcome {
        let result = match dataset {
            Dataset::Movies => decode_movie(&row),
            Dataset::Credits => decode_credits(&row),
            Dataset::Keywords => decode_keywords(&row),
            Dataset::Ratings => decode_rating(&row),
            Dataset::Links => self.decode_link(&row),
        };

        match result {
            Ok(staged) => DecodeOutcome::Decoded(staged),
            Err(reason) => DecodeOutcome::Rejected { reason, raw: row },
        }
    }

    fn decode_link(&self, row: &RawRow) -> Result<Staged, RejectReason> {
        let movie_id = scalar::required_id(row, columns::LINK_MOVIE_ID, "movieId")?;
        let imdb_id = row
            .get_any(columns::IMDB_ID)
            .and_then(|raw| self.normalize_imdb_id(raw));
        let tmdb_id = scalar::int(row.get_any(columns::TMDB_ID));

        Ok(Staged {
            parent: StagingParent::Link(LinkStaging {
                movie_id,
                imdb_id,
                tmdb_id,
            }),
            children: Vec::new(),
            dropped_elements: 0,
        })
    }

    pub fn normalize_imdb_id(&self, raw: &str) -> Option<String> {
        let captures = self.imdb_pattern.captures(raw.trim())?;
        let digits = captures.get(1)?.as_str();
        Some(format!("tt{digits:0>7}"))
    }
}

fn decode_movie(row: &RawRow) -> Result<Staged, RejectReason> {
    let id = scalar::required_id(row, columns::MOVIE_ID, "id")?;

    let movie = MovieStaging {
        id,
        title: scalar::text(row.get("title")),
        original_title: scalar::text(row.get("original_title")),
        original_language: scalar::text(row.get("original_language")),
        overview: scalar::text(row.get("overview")),
        tagline: scalar::text(row.get("tagline")),
        status: scalar::text(row.get("status")),
        homepage: scalar::text(row.get("homepage")),
        imdb_id: scalar::text(row.get("imdb_id")),
        poster_path: scalar::text(row.get("poster_path")),
        adult: scalar::flag(row.get("adult")),
        video: scalar::flag(row.get("video")),
        budget: scalar::int(row.get("budget")),
        revenue: scalar::int(row.get("revenue")),
        runtime: scalar::float(row.get("runtime")),
        popularity: scalar::float(row.get("popularity")),
        vote_average: scalar::float(row.get("vote_average")),
        vote_count: scalar::int(row.get("vote_count")),
        release_date: scalar::date(row.get("release_date")),
        production_countries: nested::canonical_json(row.get("production_countries")),
        spoken_languages: nested::canonical_json(row.get("spoken_languages")),
    };

    let mut children = Vec::new();
    let mut dropped_elements = 0;

    for (column, shape) in [
        ("genres", NestedShape::Genre),
        ("production_companies", NestedShape::Company),
    ] {
        let decoded = decode_list(row.get(column), shape);
        dropped_elements += decoded.dropped;
        push_children(&mut children, id, decoded.entities);
    }
    if let Some(collection) = decode_single(row.get("belongs_to_collection"), NestedShape::Collection)
    {
        push_children(&mut children, id, vec![collection]);
    }

    Ok(Staged {
        parent: StagingParent::Movie(movie),
        children,
        dropped_elements,
    })
}

fn decode_credits(row: &RawRow) -> Result<Staged, RejectReason> {
    let movie_id = scalar::required_id(row, columns::MOVIE_ID, "id")?;
    let cast = decode_list(row.get("cast"), NestedShape::CastMember);
    let crew = decode_list(row.get("crew"), NestedShape::CrewMember);

    let mut children = Vec::with_capacity(cast.entities.len() + crew.entities.len());
    push_children(&mut children, movie_id, cast.entities);
    push_children(&mut children, movie_id, crew.entities);

    Ok(Staged {
        parent: StagingParent::CreditSet { movie_id },
        children,
        dropped_elements: cast.dropped + crew.dropped,
    })
}

fn decode_keywords(row: &RawRow) -> Result<Staged, RejectReason> {
    let movie_id = scalar::required_id(row, columns::MOVIE_ID, "id")?;
    let keywords = decode_list(row.get("keywords"), NestedShape::Keyword);

    let mut children = Vec::with_capacity(keywords.entities.len());
    push_children(&mut children, movie_id, keywords.entities);

    Ok(Staged {
        parent: StagingParent::KeywordSet { movie_id },
        children,
        dropped_elements: keywords.dropped,
    })
}

fn decode_rating(row: &RawRow) -> Result<Staged, RejectReason> {
    let user_id = scalar::required_id(row, columns::USER_ID, "userId")?;
    let movie_id = scalar::required_id(row, columns::RATING_MOVIE_ID, "movieId")?;
    let rating =
        scalar::required_float_in(row, columns::RATING_VALUE, "rating", RATING_MIN, RATING_MAX)?;
    let rated_at = scalar::required_int(row, columns::RATED_AT, "timestamp")?;

    Ok(Staged {
        parent: StagingParent::Rating(RatingStaging {
            user_id,
            movie_id,
            rating,
            rated_at,
        }),
        children: Vec::new(),
        dropped_elements: 0,
    })
}

/// Ordinals restart per entity kind so cast and crew positions stay stable
/// across reloads of the same row.
fn push_children(children: &mut Vec<ChildRecord>, movie_id: i64, entities: Vec<NestedEntity>) {
    children.extend(
        entities
            .into_iter()
            .enumerate()
            .map(|(ordinal, entity)| ChildRecord {
                movie_id,
                ordinal,
                entity,
            }),
    );
}

#[cfg(test)]
mod tests;
