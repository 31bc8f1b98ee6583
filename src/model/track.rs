use sqlx::{Sqlite, SqlitePool, Transaction};

use crate::error::Result;
use crate::parser::item::{TrackInfo, TrackType};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AudioTrack {
    pub id: i64,
    pub media_id: i64,
    pub codec: Option<String>,
    pub bitrate: i64,
    pub samplerate: i64,
    pub nb_channels: i64,
    pub language: Option<String>,
    pub description: Option<String>,
    pub attached_file_id: Option<i64>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct VideoTrack {
    pub id: i64,
    pub media_id: i64,
    pub codec: Option<String>,
    pub bitrate: i64,
    pub width: i64,
    pub height: i64,
    pub fps_num: i64,
    pub fps_den: i64,
    pub sar_num: i64,
    pub sar_den: i64,
    pub language: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SubtitleTrack {
    pub id: i64,
    pub media_id: i64,
    pub codec: Option<String>,
    pub language: Option<String>,
    pub description: Option<String>,
    pub encoding: Option<String>,
    pub attached_file_id: Option<i64>,
}

/// Replace every track of a media with the ones freshly probed, inside the
/// caller's transaction. Tracks are fully rebuilt on refresh rather than
/// diffed.
pub async fn replace_for_media(
    tx: &mut Transaction<'_, Sqlite>,
    media_id: i64,
    tracks: &[TrackInfo],
    attached_file_id: Option<i64>,
) -> std::result::Result<(), sqlx::Error> {
    for table in ["audio_tracks", "video_tracks", "subtitle_tracks"] {
        sqlx::query(&format!("DELETE FROM {table} WHERE media_id = ?"))
            .bind(media_id)
            .execute(&mut **tx)
            .await?;
    }
    for track in tracks {
        match track.track_type {
            TrackType::Audio => {
                sqlx::query(
                    "INSERT INTO audio_tracks (media_id, codec, bitrate, samplerate,
                                               nb_channels, language, description,
                                               attached_file_id)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(media_id)
                .bind(track.codec.as_deref())
                .bind(track.bitrate)
                .bind(track.samplerate)
                .bind(track.nb_channels)
                .bind(track.language.as_deref())
                .bind(track.description.as_deref())
                .bind(attached_file_id)
                .execute(&mut **tx)
                .await?;
            }
            TrackType::Video => {
                sqlx::query(
                    "INSERT INTO video_tracks (media_id, codec, bitrate, width, height,
                                               fps_num, fps_den, sar_num, sar_den,
                                               language, description)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(media_id)
                .bind(track.codec.as_deref())
                .bind(track.bitrate)
                .bind(track.width)
                .bind(track.height)
                .bind(track.fps_num)
                .bind(track.fps_den.max(1))
                .bind(track.sar_num.max(1))
                .bind(track.sar_den.max(1))
                .bind(track.language.as_deref())
                .bind(track.description.as_deref())
                .execute(&mut **tx)
                .await?;
            }
            TrackType::Subtitle => {
                sqlx::query(
                    "INSERT INTO subtitle_tracks (media_id, codec, language, description,
                                                  encoding, attached_file_id)
                     VALUES (?, ?, ?, ?, ?, ?)",
                )
                .bind(media_id)
                .bind(track.codec.as_deref())
                .bind(track.language.as_deref())
                .bind(track.description.as_deref())
                .bind(track.encoding.as_deref())
                .bind(attached_file_id)
                .execute(&mut **tx)
                .await?;
            }
        }
    }
    Ok(())
}

pub async fn audio_tracks(pool: &SqlitePool, media_id: i64) -> Result<Vec<AudioTrack>> {
    let tracks = sqlx::query_as::<_, AudioTrack>(
        "SELECT id, media_id, codec, bitrate, samplerate, nb_channels, language, description,
                attached_file_id
         FROM audio_tracks WHERE media_id = ? ORDER BY id",
    )
    .bind(media_id)
    .fetch_all(pool)
    .await?;
    Ok(tracks)
}

pub async fn video_tracks(pool: &SqlitePool, media_id: i64) -> Result<Vec<VideoTrack>> {
    let tracks = sqlx::query_as::<_, VideoTrack>(
        "SELECT id, media_id, codec, bitrate, width, height, fps_num, fps_den, sar_num, sar_den,
                language, description
         FROM video_tracks WHERE media_id = ? ORDER BY id",
    )
    .bind(media_id)
    .fetch_all(pool)
    .await?;
    Ok(tracks)
}

pub async fn subtitle_tracks(pool: &SqlitePool, media_id: i64) -> Result<Vec<SubtitleTrack>> {
    let tracks = sqlx::query_as::<_, SubtitleTrack>(
        "SELECT id, media_id, codec, language, description, encoding, attached_file_id
         FROM subtitle_tracks WHERE media_id = ? ORDER BY id",
    )
    .bind(media_id)
    .fetch_all(pool)
    .await?;
    Ok(tracks)
}
