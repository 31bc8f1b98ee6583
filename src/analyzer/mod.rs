//! Metadata analysis service: turns an extracted item into database
//! entities. Owns the album/artist matching heuristics, the video title
//! analysis and the thumbnail assignment rules.

pub mod title;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::db::schema::{UNKNOWN_ARTIST_ID, VARIOUS_ARTISTS_ID};
use crate::error::{is_foreign_key_violation, Error, Result};
use crate::model::album::Album;
use crate::model::artist::Artist;
use crate::model::device::Device;
use crate::model::file::{File, FileType, NewFile};
use crate::model::genre::Genre;
use crate::model::group::MediaGroup;
use crate::model::media::{Media, MediaSubtype, MediaType};
use crate::model::playlist::Playlist;
use crate::model::show::Show;
use crate::model::subscription::Subscription;
use crate::model::task::{LinkType, Step, Task, TaskType};
use crate::model::thumbnail::{
    Thumbnail, ThumbnailEntity, ThumbnailOrigin, ThumbnailSizeType, ThumbnailStatus,
};
use crate::model::track;
use crate::mrl;
use crate::notifier::{Change, Entity};
use crate::parser::item::{Item, Metadata};
use crate::parser::{ParserCtx, ParserService, Status};

/// Single-entry cache of the last matched album, keyed by title and
/// folder, to accelerate bulk imports of one album's tracks.
#[derive(Debug, Clone)]
struct AlbumCache {
    title: String,
    folder_id: i64,
    album_id: i64,
}

pub struct MetadataAnalyzer {
    ctx: Arc<ParserCtx>,
    album_cache: Mutex<Option<AlbumCache>>,
}

impl MetadataAnalyzer {
    pub fn new(ctx: Arc<ParserCtx>) -> MetadataAnalyzer {
        MetadataAnalyzer {
            ctx,
            album_cache: Mutex::new(None),
        }
    }

    /// Capture the filesystem identity of the input through its factory.
    async fn stat_item(&self, item: &mut Item) -> Result<()> {
        let factory = self
            .ctx
            .fs
            .factory_for_mrl(&item.mrl)
            .ok_or_else(|| Error::UnhandledScheme(item.mrl.clone()))?;
        let file = factory.create_file(&item.mrl).await?;
        item.fs_last_modified = file.last_modified();
        item.fs_size = file.size();
        Ok(())
    }

    fn display_name(item: &Item) -> String {
        mrl::decode(mrl::file_name(&item.mrl))
            .unwrap_or_else(|_| mrl::file_name(&item.mrl).to_string())
    }

    /// Pick the media type: tracks first, extension guess as fallback.
    fn guess_media_type(item: &Item) -> MediaType {
        if item.has_video_track() {
            return MediaType::Video;
        }
        if item.has_audio_track() {
            return MediaType::Audio;
        }
        match mrl::extension(&item.mrl) {
            Some(e) if crate::config::ext::is_audio(&e) => MediaType::Audio,
            Some(e) if crate::config::ext::is_media(&e) => MediaType::Video,
            _ => MediaType::Unknown,
        }
    }

    /// Create (or adopt) the File and Media rows for a creation task. An
    /// external media already carrying this mrl is promoted in place,
    /// preserving its id.
    async fn ensure_file_and_media(&self, item: &mut Item) -> Result<Status> {
        if item.file.is_some() {
            return Ok(Status::Success);
        }
        let Some(folder) = item.parent_folder.clone() else {
            tracing::warn!("Creation task without parent folder for {}", item.mrl);
            return Ok(Status::Discarded);
        };
        let device = Device::by_id(&self.ctx.pool, folder.device_id)
            .await?
            .ok_or(Error::DeviceRemoved)?;

        // Removable files store only their leaf name; the device
        // mountpoint is prepended on access.
        let stored_mrl = if device.is_removable {
            mrl::file_name(&item.mrl).to_string()
        } else {
            item.mrl.clone()
        };

        if let Some(existing) = File::by_mrl_in_folder(&self.ctx.pool, folder.id, &stored_mrl).await?
        {
            // A previous run of this task got as far as creating the rows.
            if let Some(media_id) = existing.media_id {
                item.media = Media::by_id(&self.ctx.pool, media_id).await?;
            }
            item.file = Some(existing);
            return Ok(Status::Success);
        }

        let media_type = Self::guess_media_type(item);
        let name = Self::display_name(item);
        let title = item
            .meta(Metadata::Title)
            .map(String::from)
            .unwrap_or_else(|| title::sanitize(&name));

        let media = match Media::by_mrl(&self.ctx.pool, &item.mrl).await? {
            Some(external) if external.is_external => {
                Media::convert_to_internal(&self.ctx.pool, external.id, media_type, &title, &name)
                    .await?;
                self.ctx
                    .notifier
                    .notify(Entity::Media, Change::Updated, external.id);
                Media::by_id(&self.ctx.pool, external.id)
                    .await?
                    .ok_or(Error::NotFound {
                        target: "media",
                        container: item.mrl.clone(),
                    })?
            }
            Some(internal) => internal,
            None => {
                let media = Media::create(&self.ctx.pool, media_type, &title, &name).await?;
                self.ctx
                    .notifier
                    .notify(Entity::Media, Change::Added, media.id);
                media
            }
        };

        let new_file = NewFile {
            folder_id: Some(folder.id),
            mrl: &stored_mrl,
            file_type: FileType::Main,
            last_modified: item.fs_last_modified,
            size: item.fs_size,
            is_removable: device.is_removable,
            is_network: device.is_network,
        };
        let file = File::create_for_media(&self.ctx.pool, media.id, &new_file).await?;
        Task::set_file_id(&self.ctx.pool, item.task.id, file.id).await?;
        item.file = Some(file);
        item.media = Some(media);
        Ok(Status::Success)
    }

    /// Persist the probed tracks. A foreign key error means the owning
    /// media was deleted concurrently.
    async fn store_tracks(&self, media_id: i64, item: &Item) -> Result<Status> {
        let mut tx = self.ctx.pool.begin().await?;
        if let Err(e) = track::replace_for_media(&mut tx, media_id, &item.tracks, None).await {
            if is_foreign_key_violation(&e) {
                tracing::debug!("Media {} deleted concurrently, discarding task", media_id);
                return Ok(Status::Discarded);
            }
            return Err(e.into());
        }
        tx.commit().await?;
        if let Some(duration) = item.duration {
            Media::set_duration(&self.ctx.pool, media_id, duration).await?;
        }
        Ok(Status::Success)
    }

    async fn parse_media(&self, item: &mut Item) -> Result<Status> {
        self.stat_item(item).await?;
        match self.ensure_file_and_media(item).await? {
            Status::Success => {}
            other => return Ok(other),
        }
        let media = item.media.clone().ok_or(Error::NotFound {
            target: "media",
            container: item.mrl.clone(),
        })?;
        match self.store_tracks(media.id, item).await? {
            Status::Success => {}
            other => return Ok(other),
        }

        let media_type = Self::guess_media_type(item);
        if media.media_type() != media_type && media_type != MediaType::Unknown {
            Media::set_type(&self.ctx.pool, media.id, media_type).await?;
        }
        match media_type {
            MediaType::Audio => self.link_audio(item, &media).await?,
            MediaType::Video => self.link_video(item, &media).await?,
            MediaType::Unknown => {}
        }
        Ok(Status::Success)
    }

    // ---- audio ----------------------------------------------------------

    async fn resolve_genre(&self, item: &Item) -> Result<Option<Genre>> {
        let Some(name) = item.meta(Metadata::Genre) else {
            return Ok(None);
        };
        let existing = Genre::by_name(&self.ctx.pool, name).await?;
        let genre = match existing {
            Some(genre) => genre,
            None => {
                let genre = Genre::create_or_get(&self.ctx.pool, name).await?;
                self.ctx
                    .notifier
                    .notify(Entity::Genre, Change::Added, genre.id);
                genre
            }
        };
        Ok(Some(genre))
    }

    async fn resolve_artist(&self, name: Option<&str>) -> Result<Option<Artist>> {
        let Some(name) = name else { return Ok(None) };
        let existing = Artist::by_name(&self.ctx.pool, name).await?;
        match existing {
            Some(artist) => Ok(Some(artist)),
            None => {
                let artist = Artist::create_or_get(&self.ctx.pool, name).await?;
                self.ctx
                    .notifier
                    .notify(Entity::Artist, Change::Added, artist.id);
                Ok(Some(artist))
            }
        }
    }

    async fn link_audio(&self, item: &mut Item, media: &Media) -> Result<()> {
        if media.subtype() == MediaSubtype::AlbumTrack {
            // Already linked by a previous run of this task.
            return Ok(());
        }
        let genre = self.resolve_genre(item).await?;
        let album_artist = self.resolve_artist(item.meta(Metadata::AlbumArtist)).await?;
        let track_artist = self.resolve_artist(item.meta(Metadata::Artist)).await?;

        // Sentinel fallbacks: a track with no artist tags at all belongs
        // to Unknown Artist.
        let album_artist_id = album_artist
            .as_ref()
            .or(track_artist.as_ref())
            .map(|a| a.id)
            .unwrap_or(UNKNOWN_ARTIST_ID);
        let track_artist_id = track_artist
            .as_ref()
            .or(album_artist.as_ref())
            .map(|a| a.id)
            .unwrap_or(UNKNOWN_ARTIST_ID);

        let release_year = parse_year(item.meta(Metadata::Date));
        if let Some(year) = release_year {
            Media::set_release_date(&self.ctx.pool, media.id, Some(year)).await?;
        }

        let Some(album_name) = item.meta(Metadata::Album).map(String::from) else {
            Artist::add_track_count(&self.ctx.pool, track_artist_id, 1).await?;
            return Ok(());
        };

        let disc_number = item.meta_i64(Metadata::DiscNumber).unwrap_or(1);
        let disc_total = item.meta_i64(Metadata::DiscTotal).unwrap_or(1);
        let track_number = item.meta_i64(Metadata::TrackNumber).unwrap_or(0);
        let folder_id = item.parent_folder.as_ref().map(|f| f.id).unwrap_or(0);

        // Only an explicitly tagged album artist participates in the
        // candidate filter; the track-artist fallback is too weak to
        // disqualify an album.
        let tagged_album_artist = album_artist.as_ref().map(|a| a.id);
        let album = self
            .find_album(
                &album_name,
                tagged_album_artist,
                album_artist_id,
                disc_number,
                disc_total,
                release_year,
                folder_id,
            )
            .await?;
        let album = match album {
            Some(album) => {
                // Heterogeneous album artists promote the album to
                // Various Artists.
                if let Some(current) = album.artist_id {
                    if current != album_artist_id
                        && album_artist_id != UNKNOWN_ARTIST_ID
                        && current != VARIOUS_ARTISTS_ID
                    {
                        Album::set_album_artist(&self.ctx.pool, album.id, VARIOUS_ARTISTS_ID)
                            .await?;
                        self.ctx
                            .notifier
                            .notify(Entity::Album, Change::Updated, album.id);
                    }
                }
                album
            }
            None => {
                let album =
                    Album::create(&self.ctx.pool, &album_name, Some(album_artist_id), release_year)
                        .await?;
                Artist::add_album_count(&self.ctx.pool, album_artist_id, 1).await?;
                self.ctx
                    .notifier
                    .notify(Entity::Album, Change::Added, album.id);
                album
            }
        };

        Album::add_track(
            &self.ctx.pool,
            album.id,
            media.id,
            Some(track_artist_id),
            genre.as_ref().map(|g| g.id),
            track_number,
            disc_number,
            item.duration.unwrap_or(0),
        )
        .await?;
        Artist::add_track_count(&self.ctx.pool, track_artist_id, 1).await?;
        self.ctx
            .notifier
            .notify(Entity::Album, Change::Updated, album.id);
        self.ctx
            .notifier
            .notify(Entity::Artist, Change::Updated, track_artist_id);

        self.assign_thumbnail(item, media.id, Some(album.id), album_artist_id)
            .await?;

        *self.album_cache.lock().await = Some(AlbumCache {
            title: album_name.to_lowercase(),
            folder_id,
            album_id: album.id,
        });
        Ok(())
    }

    /// Album matching rules; see the cascade in order. Returns the album
    /// to attach the track to, or `None` when a new one must be created.
    #[allow(clippy::too_many_arguments)]
    async fn find_album(
        &self,
        album_name: &str,
        tagged_album_artist: Option<i64>,
        album_artist_id: i64,
        disc_number: i64,
        disc_total: i64,
        release_year: Option<i64>,
        folder_id: i64,
    ) -> Result<Option<Album>> {
        // Short-circuit: the previous task produced an album of the same
        // name in the same folder.
        {
            let cache = self.album_cache.lock().await;
            if let Some(cached) = cache.as_ref() {
                if cached.title == album_name.to_lowercase() && cached.folder_id == folder_id {
                    if let Some(album) = Album::by_id(&self.ctx.pool, cached.album_id).await? {
                        return Ok(Some(album));
                    }
                }
            }
        }

        let candidates = Album::by_title(&self.ctx.pool, album_name).await?;
        let mut retained = Vec::new();
        for candidate in candidates {
            // A known album artist must match the candidate's.
            if let Some(tagged) = tagged_album_artist {
                if let Some(candidate_artist) = candidate.artist_id {
                    if candidate_artist != tagged && candidate_artist != VARIOUS_ARTISTS_ID {
                        continue;
                    }
                }
            }
            // Multi-disc albums may live in sibling folders.
            if disc_total > 1 || disc_number > 1 {
                retained.push(candidate);
                continue;
            }
            if Album::has_multiple_discs(&self.ctx.pool, candidate.id).await? {
                retained.push(candidate);
                continue;
            }
            // Single-disc candidates must share the folder, or at least
            // the release year for single-artist albums.
            if Album::nb_tracks_in_folder(&self.ctx.pool, candidate.id, folder_id).await? > 0 {
                retained.push(candidate);
                continue;
            }
            let single_artist = candidate
                .artist_id
                .is_some_and(|a| a != VARIOUS_ARTISTS_ID && a == album_artist_id);
            if single_artist
                && release_year.is_some()
                && candidate.release_year == release_year
            {
                retained.push(candidate);
            }
        }
        if retained.len() > 1 {
            tracing::warn!(
                "{} candidate albums named '{}' remain, picking the first",
                retained.len(),
                album_name
            );
        }
        Ok(retained.into_iter().next())
    }

    // ---- thumbnails ------------------------------------------------------

    /// Pick a thumbnail for a media and share it with its album, its
    /// album artist and the album's other bare tracks. User-provided
    /// thumbnails are never overridden.
    async fn assign_thumbnail(
        &self,
        item: &Item,
        media_id: i64,
        album_id: Option<i64>,
        album_artist_id: i64,
    ) -> Result<()> {
        let size = ThumbnailSizeType::Thumbnail;
        if Thumbnail::for_entity(&self.ctx.pool, ThumbnailEntity::Media, media_id, size)
            .await?
            .is_some()
        {
            return Ok(());
        }

        let (source_mrl, origin, owned) = match item.embedded_thumbnails.first() {
            Some(embedded) => (embedded.clone(), ThumbnailOrigin::Media, true),
            None => match self.find_cover_file(item).await? {
                Some(cover) => (cover, ThumbnailOrigin::CoverFile, false),
                None => return Ok(()),
            },
        };

        let thumbnail = match Thumbnail::by_mrl(&self.ctx.pool, &source_mrl, size).await? {
            Some(existing) => existing,
            None => {
                Thumbnail::insert(
                    &self.ctx.pool,
                    Some(&source_mrl),
                    origin,
                    size,
                    ThumbnailStatus::Available,
                    owned,
                )
                .await?
            }
        };
        Thumbnail::link(&self.ctx.pool, ThumbnailEntity::Media, media_id, size, thumbnail.id)
            .await?;

        if let Some(album_id) = album_id {
            let album_thumb =
                Thumbnail::for_entity(&self.ctx.pool, ThumbnailEntity::Album, album_id, size)
                    .await?;
            if album_thumb.is_none() {
                Thumbnail::link(
                    &self.ctx.pool,
                    ThumbnailEntity::Album,
                    album_id,
                    size,
                    thumbnail.id,
                )
                .await?;
                // The album just received its first thumbnail: share it
                // with the album's other bare tracks.
                let rows: Vec<(i64,)> = sqlx::query_as(
                    "SELECT media_id FROM album_tracks WHERE album_id = ? AND media_id != ?",
                )
                .bind(album_id)
                .bind(media_id)
                .fetch_all(&self.ctx.pool)
                .await?;
                for (other_media,) in rows {
                    let has = Thumbnail::for_entity(
                        &self.ctx.pool,
                        ThumbnailEntity::Media,
                        other_media,
                        size,
                    )
                    .await?;
                    if has.is_none() {
                        Thumbnail::link(
                            &self.ctx.pool,
                            ThumbnailEntity::Media,
                            other_media,
                            size,
                            thumbnail.id,
                        )
                        .await?;
                    }
                }
            }
        }

        if album_artist_id != UNKNOWN_ARTIST_ID && album_artist_id != VARIOUS_ARTISTS_ID {
            let artist_thumb = Thumbnail::for_entity(
                &self.ctx.pool,
                ThumbnailEntity::Artist,
                album_artist_id,
                size,
            )
            .await?;
            if artist_thumb.is_none() {
                Thumbnail::link(
                    &self.ctx.pool,
                    ThumbnailEntity::Artist,
                    album_artist_id,
                    size,
                    thumbnail.id,
                )
                .await?;
            }
        }
        Ok(())
    }

    /// `*.{jpg,jpeg,png}` cover files in the media's folder; conventional
    /// names win over the rest.
    async fn find_cover_file(&self, item: &Item) -> Result<Option<String>> {
        let Some(factory) = self.ctx.fs.factory_for_mrl(&item.mrl) else {
            return Ok(None);
        };
        let parent = mrl::directory(&item.mrl);
        let Ok(dir) = factory.create_directory(parent).await else {
            return Ok(None);
        };
        let files = match dir.files().await {
            Ok(files) => files,
            Err(_) => return Ok(None),
        };
        let mut candidates: Vec<(String, String)> = files
            .iter()
            .filter(|f| {
                matches!(
                    f.extension().as_deref(),
                    Some("jpg") | Some("jpeg") | Some("png")
                )
            })
            .map(|f| (f.name().to_lowercase(), f.mrl()))
            .collect();
        candidates.sort();
        let preferred = candidates.iter().find(|(name, _)| {
            name.starts_with("cover") || name.starts_with("folder") || name.starts_with("front")
        });
        Ok(preferred
            .or_else(|| candidates.first())
            .map(|(_, cover_mrl)| cover_mrl.clone()))
    }

    // ---- video -----------------------------------------------------------

    async fn link_video(&self, item: &mut Item, media: &Media) -> Result<()> {
        let already_episode = media.subtype() == MediaSubtype::ShowEpisode;
        let name = Self::display_name(item);
        let (sanitized, pattern) = title::analyze(&name);

        let title = item.meta(Metadata::Title).unwrap_or(&sanitized).to_string();
        if media.title.as_deref() != Some(title.as_str()) {
            Media::set_title(&self.ctx.pool, media.id, &title).await?;
        }

        // Container metadata overrides the filename heuristics.
        let (show_name, season, episode, episode_title) = match (
            item.meta(Metadata::ShowName),
            item.meta_i64(Metadata::Episode),
        ) {
            (Some(show), Some(episode)) => (
                Some(show.to_string()),
                item.meta_i64(Metadata::Season).unwrap_or(1),
                Some(episode),
                None,
            ),
            _ => match pattern {
                Some(found) => (
                    Some(found.show_name),
                    found.season,
                    Some(found.episode),
                    found.episode_title,
                ),
                None => (None, 0, None, None),
            },
        };

        if let (false, Some(show_name), Some(episode)) =
            (already_episode, show_name.clone(), episode)
        {
            let existed = !show_name.is_empty()
                && sqlx::query_as::<_, (i64,)>(
                    "SELECT id FROM shows WHERE title = ? COLLATE NOCASE",
                )
                .bind(&show_name)
                .fetch_optional(&self.ctx.pool)
                .await?
                .is_some();
            let show = Show::create_or_get(&self.ctx.pool, &show_name).await?;
            if !existed && !show_name.is_empty() {
                self.ctx.notifier.notify(Entity::Show, Change::Added, show.id);
            }
            Show::add_episode(
                &self.ctx.pool,
                show.id,
                media.id,
                season,
                episode,
                episode_title.as_deref(),
            )
            .await?;
            self.ctx.notifier.notify(Entity::Show, Change::Updated, show.id);
        }

        // Every video belongs to a media group, keyed by the show name
        // when there is one, the sanitised title otherwise.
        let group_name = show_name.filter(|s| !s.is_empty()).unwrap_or(sanitized);
        if !group_name.is_empty() && media.group_id.is_none() {
            let existed = MediaGroup::by_name(&self.ctx.pool, &group_name).await?;
            let group = MediaGroup::assign(&self.ctx.pool, &group_name, media.id).await?;
            let change = if existed.is_some() {
                Change::Updated
            } else {
                Change::Added
            };
            self.ctx.notifier.notify(Entity::MediaGroup, change, group.id);
        }
        Ok(())
    }

    // ---- playlists & subscriptions --------------------------------------

    /// Schedule a Link task per sub-item; a sub-item designating a local
    /// directory is walked and contributes one task per ingestible file.
    async fn schedule_playlist_items(&self, item: &Item, playlist_id: i64) -> Result<u64> {
        let mut scheduled = 0u64;
        let mut position: i64 = 0;
        for sub in &item.sub_items {
            let walked = self.walk_directory_entries(&sub.mrl).await;
            match walked {
                Some(entries) => {
                    for entry in entries {
                        if Task::create_link(
                            &self.ctx.pool,
                            LinkType::Playlist,
                            playlist_id,
                            position,
                            &entry,
                            None,
                        )
                        .await?
                        .is_some()
                        {
                            scheduled += 1;
                        }
                        position += 1;
                    }
                }
                None => {
                    if Task::create_link(
                        &self.ctx.pool,
                        LinkType::Playlist,
                        playlist_id,
                        position,
                        &sub.mrl,
                        None,
                    )
                    .await?
                    .is_some()
                    {
                        scheduled += 1;
                    }
                    position += 1;
                }
            }
        }
        Ok(scheduled)
    }

    /// If the mrl designates a directory, return its ingestible files in
    /// name order.
    async fn walk_directory_entries(&self, target: &str) -> Option<Vec<String>> {
        if mrl::extension(target).is_some() {
            return None;
        }
        let factory = self.ctx.fs.factory_for_mrl(target)?;
        let dir = factory.create_directory(target).await.ok()?;
        let files = dir.files().await.ok()?;
        let mut entries: Vec<String> = files
            .iter()
            .map(|f| f.mrl())
            .filter(|m| crate::parser::extractor::is_ingestible(m))
            .collect();
        entries.sort();
        Some(entries)
    }

    async fn parse_playlist(&self, item: &mut Item) -> Result<Status> {
        self.stat_item(item).await?;
        let Some(folder) = item.parent_folder.clone() else {
            return Ok(Status::Discarded);
        };
        let name = item
            .meta(Metadata::Title)
            .map(String::from)
            .unwrap_or_else(|| stem_of(&Self::display_name(item)));

        let playlist = match &item.file {
            Some(file) => match Playlist::by_file(&self.ctx.pool, file.id).await? {
                Some(playlist) => playlist,
                None => return Ok(Status::Discarded),
            },
            None => {
                let playlist = Playlist::create(&self.ctx.pool, &name).await?;
                let new_file = NewFile {
                    folder_id: Some(folder.id),
                    mrl: &item.mrl,
                    file_type: FileType::Playlist,
                    last_modified: item.fs_last_modified,
                    size: item.fs_size,
                    is_removable: false,
                    is_network: false,
                };
                let file = File::create_for_playlist(&self.ctx.pool, playlist.id, &new_file).await?;
                Task::set_file_id(&self.ctx.pool, item.task.id, file.id).await?;
                item.file = Some(file);
                self.ctx
                    .notifier
                    .notify(Entity::Playlist, Change::Added, playlist.id);
                playlist
            }
        };

        let scheduled = self.schedule_playlist_items(item, playlist.id).await?;
        tracing::debug!(
            "Playlist '{}': {} item(s) scheduled for linking",
            name,
            scheduled
        );
        Ok(Status::Completed)
    }

    /// Restore a playlist from a migration backup file.
    async fn restore_playlist(&self, item: &mut Item) -> Result<Status> {
        let name = item
            .meta(Metadata::Title)
            .map(String::from)
            .unwrap_or_else(|| stem_of(&Self::display_name(item)));
        let playlist = Playlist::create(&self.ctx.pool, &name).await?;
        self.ctx
            .notifier
            .notify(Entity::Playlist, Change::Added, playlist.id);
        self.schedule_playlist_items(item, playlist.id).await?;
        Ok(Status::Completed)
    }

    async fn parse_subscription(&self, item: &mut Item) -> Result<Status> {
        self.stat_item(item).await?;
        let Some(folder) = item.parent_folder.clone() else {
            return Ok(Status::Discarded);
        };
        let name = item
            .meta(Metadata::Title)
            .map(String::from)
            .unwrap_or_else(|| stem_of(&Self::display_name(item)));

        let subscription = match &item.file {
            Some(file) => match Subscription::by_file(&self.ctx.pool, file.id).await? {
                Some(subscription) => subscription,
                None => return Ok(Status::Discarded),
            },
            None => {
                let subscription =
                    Subscription::create(&self.ctx.pool, "rss", &name, None).await?;
                let new_file = NewFile {
                    folder_id: Some(folder.id),
                    mrl: &item.mrl,
                    file_type: FileType::Subscription,
                    last_modified: item.fs_last_modified,
                    size: item.fs_size,
                    is_removable: false,
                    is_network: false,
                };
                let file =
                    File::create_for_subscription(&self.ctx.pool, subscription.id, &new_file)
                        .await?;
                Task::set_file_id(&self.ctx.pool, item.task.id, file.id).await?;
                item.file = Some(file);
                self.ctx
                    .notifier
                    .notify(Entity::Subscription, Change::Added, subscription.id);
                subscription
            }
        };

        for sub in &item.sub_items {
            // Each feed entry becomes an external media carrying its feed
            // metadata, then a Link task attaches it to the subscription.
            if Media::by_mrl(&self.ctx.pool, &sub.mrl).await?.is_none() {
                let sub_title = sub
                    .title
                    .clone()
                    .unwrap_or_else(|| mrl::file_name(&sub.mrl).to_string());
                let media =
                    Media::create_external(&self.ctx.pool, &sub.mrl, &sub_title, sub.release_date)
                        .await?;
                self.ctx.notifier.notify(Entity::Media, Change::Added, media.id);
            }
            Task::create_link(
                &self.ctx.pool,
                LinkType::Subscription,
                subscription.id,
                sub.index,
                &sub.mrl,
                None,
            )
            .await?;
        }
        Ok(Status::Completed)
    }

    // ---- refresh ---------------------------------------------------------

    async fn refresh(&self, item: &mut Item) -> Result<Status> {
        let Some(file) = item.file.clone() else {
            return Ok(Status::Discarded);
        };
        self.stat_item(item).await?;

        match file.file_type() {
            FileType::Playlist => {
                let Some(playlist) = Playlist::by_file(&self.ctx.pool, file.id).await? else {
                    return Ok(Status::Discarded);
                };
                Task::remove_playlist_content_tasks(&self.ctx.pool, playlist.id).await?;
                Playlist::clear(&self.ctx.pool, playlist.id).await?;
                self.schedule_playlist_items(item, playlist.id).await?;
                File::update_last_modified(&self.ctx.pool, file.id, item.fs_last_modified)
                    .await?;
                self.ctx
                    .notifier
                    .notify(Entity::Playlist, Change::Updated, playlist.id);
                Ok(Status::Completed)
            }
            FileType::Subscription => {
                let Some(subscription) = Subscription::by_file(&self.ctx.pool, file.id).await?
                else {
                    return Ok(Status::Discarded);
                };
                for sub in &item.sub_items {
                    if Media::by_mrl(&self.ctx.pool, &sub.mrl).await?.is_none() {
                        let sub_title = sub
                            .title
                            .clone()
                            .unwrap_or_else(|| mrl::file_name(&sub.mrl).to_string());
                        let media = Media::create_external(
                            &self.ctx.pool,
                            &sub.mrl,
                            &sub_title,
                            sub.release_date,
                        )
                        .await?;
                        self.ctx.notifier.notify(Entity::Media, Change::Added, media.id);
                    }
                    Task::create_link(
                        &self.ctx.pool,
                        LinkType::Subscription,
                        subscription.id,
                        sub.index,
                        &sub.mrl,
                        None,
                    )
                    .await?;
                }
                File::update_last_modified(&self.ctx.pool, file.id, item.fs_last_modified)
                    .await?;
                self.ctx
                    .notifier
                    .notify(Entity::Subscription, Change::Updated, subscription.id);
                Ok(Status::Completed)
            }
            _ => {
                let Some(media) = item.media.clone() else {
                    return Ok(Status::Discarded);
                };
                match self.store_tracks(media.id, item).await? {
                    Status::Success => {}
                    other => return Ok(other),
                }
                // Relink the subtype-specific rows from scratch.
                match media.subtype() {
                    MediaSubtype::AlbumTrack => {
                        Album::remove_track(&self.ctx.pool, media.id).await?;
                        Media::set_subtype(&self.ctx.pool, media.id, MediaSubtype::Unknown)
                            .await?;
                    }
                    MediaSubtype::ShowEpisode | MediaSubtype::Movie | MediaSubtype::Unknown => {}
                }
                let media_type = Self::guess_media_type(item);
                if media.media_type() != media_type && media_type != MediaType::Unknown {
                    Media::set_type(&self.ctx.pool, media.id, media_type).await?;
                }
                // Relinking reads the post-reset state, not the snapshot
                // taken before the subtype was cleared.
                let media = Media::by_id(&self.ctx.pool, media.id)
                    .await?
                    .ok_or(Error::NotFound {
                        target: "media",
                        container: item.mrl.clone(),
                    })?;
                match media_type {
                    MediaType::Audio => self.link_audio(item, &media).await?,
                    MediaType::Video => self.link_video(item, &media).await?,
                    MediaType::Unknown => {}
                }
                // The file's last-modified moves only once everything else
                // succeeded, so a crashed refresh reruns.
                File::update_last_modified(&self.ctx.pool, file.id, item.fs_last_modified)
                    .await?;
                File::update_size(&self.ctx.pool, file.id, item.fs_size).await?;
                self.ctx.notifier.notify(Entity::Media, Change::Updated, media.id);
                Ok(Status::Success)
            }
        }
    }
}

/// First plausible year in a date meta string.
fn parse_year(raw: Option<&str>) -> Option<i64> {
    let raw = raw?;
    let digits: Vec<i64> = raw
        .split(|c: char| !c.is_ascii_digit())
        .filter(|s| s.len() == 4)
        .filter_map(|s| s.parse().ok())
        .collect();
    digits.into_iter().find(|y| (1000..=2999).contains(y))
}

fn stem_of(name: &str) -> String {
    match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem.to_string(),
        _ => name.to_string(),
    }
}

#[async_trait]
impl ParserService for MetadataAnalyzer {
    fn name(&self) -> &'static str {
        "metadata-analysis"
    }

    fn targeted_step(&self) -> Step {
        Step::MetadataAnalysis
    }

    fn priority(&self) -> u8 {
        50
    }

    async fn run(&self, item: &mut Item) -> Status {
        let result = match item.task.task_type() {
            TaskType::Link => return Status::Success,
            TaskType::Restore => self.restore_playlist(item).await,
            TaskType::Refresh => self.refresh(item).await,
            TaskType::Creation => match item.file_type {
                FileType::Playlist => self.parse_playlist(item).await,
                FileType::Subscription => self.parse_subscription(item).await,
                FileType::Subtitle | FileType::Soundtrack | FileType::Unknown => {
                    // Nothing to analyse; the row (if any) was written at
                    // discovery time.
                    return Status::Completed;
                }
                _ => self.parse_media(item).await,
            },
        };
        match result {
            Ok(status) => status,
            Err(Error::DeviceRemoved) | Err(Error::Interrupted) => Status::Requeue,
            Err(e) => {
                tracing::warn!("Analysis failed for {}: {}", item.mrl, e);
                Status::Fatal
            }
        }
    }

    async fn flush(&self) {
        *self.album_cache.lock().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::access::PriorityAccess;
    use crate::db::{connect_in_memory, schema};
    use crate::fs::mock::MockFs;
    use crate::fs::FsHolder;
    use crate::model::folder::Folder;
    use crate::notifier::{NoopCb, NotifierWorker};
    use crate::parser::probe::{MediaProbe, ProbeResult};
    use crate::parser::item::TrackType;
    use sqlx::SqlitePool;
    use std::collections::HashMap;
    use std::path::Path;

    struct StubProbe;
    impl MediaProbe for StubProbe {
        fn probe(&self, _path: &Path, _artwork_dir: &Path) -> anyhow::Result<ProbeResult> {
            Ok(ProbeResult::default())
        }
    }

    async fn setup() -> (SqlitePool, MockFs, MetadataAnalyzer, Folder) {
        let pool = connect_in_memory().await.unwrap();
        schema::create_all(&pool).await.unwrap();
        let mock = MockFs::new();
        mock.add_folder("file:///music/");
        let device = Device::create(&pool, "mock-root", "file://", false, false)
            .await
            .unwrap();
        let folder = Folder::create(&pool, "file:///music/", "music", device.id, None, 0, true)
            .await
            .unwrap();
        let (notifier, _worker) = NotifierWorker::new(Arc::new(NoopCb));
        let ctx = Arc::new(ParserCtx {
            pool: pool.clone(),
            notifier,
            cb: Arc::new(NoopCb),
            fs: FsHolder::new(pool.clone(), vec![Arc::new(mock.clone())]),
            access: PriorityAccess::new(),
            thumbnails_dir: std::env::temp_dir(),
            probe: Arc::new(StubProbe),
            probe_timeout: std::time::Duration::from_secs(5),
        });
        let analyzer = MetadataAnalyzer::new(ctx);
        (pool, mock, analyzer, folder)
    }

    fn audio_item(task: Task, folder: &Folder, file_mrl: &str) -> Item {
        let mut item = Item::new(task, file_mrl.to_string(), FileType::Main);
        item.parent_folder = Some(folder.clone());
        let mut track = crate::parser::item::TrackInfo::new(TrackType::Audio);
        track.codec = Some("flac".to_string());
        item.tracks = vec![track];
        item.duration = Some(180_000);
        item
    }

    async fn make_task(pool: &SqlitePool, folder: &Folder, file_mrl: &str) -> Task {
        Task::create(pool, file_mrl, FileType::Main, folder.id)
            .await
            .unwrap()
            .unwrap()
    }

    async fn ingest(
        analyzer: &MetadataAnalyzer,
        mock: &MockFs,
        pool: &SqlitePool,
        folder: &Folder,
        file_mrl: &str,
        meta: HashMap<Metadata, String>,
    ) -> Item {
        mock.add_file(file_mrl, 100, 1000);
        let task = make_task(pool, folder, file_mrl).await;
        let mut item = audio_item(task, folder, file_mrl);
        item.meta = meta;
        let status = analyzer.run(&mut item).await;
        assert_eq!(status, Status::Success);
        item
    }

    fn tags(pairs: &[(Metadata, &str)]) -> HashMap<Metadata, String> {
        pairs
            .iter()
            .map(|(k, v)| (*k, v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_same_album_same_folder_reuses() {
        let (pool, mock, analyzer, folder) = setup().await;
        let meta = tags(&[
            (Metadata::Album, "X"),
            (Metadata::AlbumArtist, "Y"),
            (Metadata::Artist, "Y"),
        ]);
        ingest(&analyzer, &mock, &pool, &folder, "file:///music/t1.mp3", meta.clone()).await;
        ingest(&analyzer, &mock, &pool, &folder, "file:///music/t2.mp3", meta).await;

        let albums: Vec<(i64, i64)> = sqlx::query_as("SELECT id, nb_tracks FROM albums")
            .fetch_all(&pool)
            .await
            .unwrap();
        assert_eq!(albums.len(), 1);
        assert_eq!(albums[0].1, 2);
    }

    #[tokio::test]
    async fn test_multi_disc_album_across_folders() {
        let (pool, mock, analyzer, folder) = setup().await;
        let device_id = folder.device_id;
        let folder_b = Folder::create(&pool, "file:///b/", "b", device_id, None, 0, true)
            .await
            .unwrap();
        mock.add_folder("file:///b/");

        let meta = tags(&[
            (Metadata::Album, "X"),
            (Metadata::AlbumArtist, "Y"),
            (Metadata::DiscTotal, "2"),
        ]);
        ingest(&analyzer, &mock, &pool, &folder, "file:///music/track1.mp3", meta.clone()).await;
        // Invalidate the single-entry cache so the full matching cascade
        // runs for the second disc.
        analyzer.flush().await;
        let mut meta_b = meta.clone();
        meta_b.insert(Metadata::DiscNumber, "2".to_string());
        mock.add_file("file:///b/track2.mp3", 100, 1000);
        let task = make_task(&pool, &folder_b, "file:///b/track2.mp3").await;
        let mut item = audio_item(task, &folder_b, "file:///b/track2.mp3");
        item.meta = meta_b;
        assert_eq!(analyzer.run(&mut item).await, Status::Success);

        let albums: Vec<(i64, i64)> = sqlx::query_as("SELECT id, nb_tracks FROM albums")
            .fetch_all(&pool)
            .await
            .unwrap();
        assert_eq!(albums.len(), 1, "second disc must reuse the album");
        assert_eq!(albums[0].1, 2);
    }

    #[tokio::test]
    async fn test_same_name_different_folder_creates_new_album() {
        let (pool, mock, analyzer, folder) = setup().await;
        let folder_b = Folder::create(&pool, "file:///b/", "b", folder.device_id, None, 0, true)
            .await
            .unwrap();
        mock.add_folder("file:///b/");

        let meta = tags(&[(Metadata::Album, "Greatest Hits"), (Metadata::AlbumArtist, "A")]);
        ingest(&analyzer, &mock, &pool, &folder, "file:///music/t1.mp3", meta.clone()).await;
        analyzer.flush().await;

        let meta_b = tags(&[(Metadata::Album, "Greatest Hits"), (Metadata::AlbumArtist, "B")]);
        mock.add_file("file:///b/t1.mp3", 100, 1000);
        let task = make_task(&pool, &folder_b, "file:///b/t1.mp3").await;
        let mut item = audio_item(task, &folder_b, "file:///b/t1.mp3");
        item.meta = meta_b;
        assert_eq!(analyzer.run(&mut item).await, Status::Success);

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM albums")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 2, "different album artists must not merge");
    }

    #[tokio::test]
    async fn test_heterogeneous_album_artist_promotes_various() {
        let (pool, mock, analyzer, folder) = setup().await;
        let meta_a = tags(&[(Metadata::Album, "Mix"), (Metadata::AlbumArtist, "A")]);
        ingest(&analyzer, &mock, &pool, &folder, "file:///music/a.mp3", meta_a).await;

        // Same folder, same album name, different album artist: the first
        // candidate survives the folder rule and the album is promoted.
        let meta_b = tags(&[(Metadata::Album, "Mix"), (Metadata::AlbumArtist, "A")]);
        ingest(&analyzer, &mock, &pool, &folder, "file:///music/b.mp3", meta_b).await;
        let meta_c = tags(&[(Metadata::Album, "Mix"), (Metadata::Artist, "C")]);
        ingest(&analyzer, &mock, &pool, &folder, "file:///music/c.mp3", meta_c).await;

        let (artist_id,): (Option<i64>,) = sqlx::query_as("SELECT artist_id FROM albums")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(artist_id, Some(VARIOUS_ARTISTS_ID));
    }

    #[tokio::test]
    async fn test_reingesting_same_file_keeps_album_and_artist_ids() {
        let (pool, mock, analyzer, folder) = setup().await;
        let meta = tags(&[(Metadata::Album, "X"), (Metadata::Artist, "Solo")]);
        ingest(&analyzer, &mock, &pool, &folder, "file:///music/one.mp3", meta.clone()).await;
        let before: Vec<(i64, i64)> =
            sqlx::query_as("SELECT id, artist_id FROM albums")
                .fetch_all(&pool)
                .await
                .unwrap();

        // Second creation task for the same mrl adopts the existing rows.
        let task = Task {
            id: 999,
            task_type: TaskType::Creation as i64,
            step: 0,
            retry_count: 0,
            mrl: Some("file:///music/one.mp3".to_string()),
            file_type: FileType::Main as i64,
            file_id: None,
            parent_folder_id: Some(folder.id),
            is_completed: false,
            link_to_type: 0,
            link_to_id: 0,
            link_extra: 0,
        };
        let mut item = audio_item(task, &folder, "file:///music/one.mp3");
        item.meta = meta;
        assert_eq!(analyzer.run(&mut item).await, Status::Success);

        let after: Vec<(i64, i64)> = sqlx::query_as("SELECT id, artist_id FROM albums")
            .fetch_all(&pool)
            .await
            .unwrap();
        assert_eq!(before, after);
        let (media_count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM media")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(media_count, 1);
    }

    #[tokio::test]
    async fn test_video_show_episode_attachment() {
        let (pool, mock, analyzer, folder) = setup().await;
        mock.add_file("file:///music/Show.Name.S01E02.mkv", 100, 1000);
        let task = make_task(&pool, &folder, "file:///music/Show.Name.S01E02.mkv").await;
        let mut item = Item::new(
            task,
            "file:///music/Show.Name.S01E02.mkv".to_string(),
            FileType::Main,
        );
        item.parent_folder = Some(folder.clone());
        let track = crate::parser::item::TrackInfo::new(TrackType::Video);
        item.tracks = vec![track];
        assert_eq!(analyzer.run(&mut item).await, Status::Success);

        let (season, episode): (i64, i64) = sqlx::query_as(
            "SELECT season_number, episode_number FROM show_episodes LIMIT 1",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!((season, episode), (1, 2));
        let (show_title,): (Option<String>,) =
            sqlx::query_as("SELECT title FROM shows WHERE id != 1")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(show_title.as_deref(), Some("Show Name"));
    }

    #[tokio::test]
    async fn test_playlist_schedules_ordered_link_tasks() {
        let (pool, mock, analyzer, folder) = setup().await;
        mock.add_file("file:///music/pl.m3u", 100, 64);
        let task = Task::create(&pool, "file:///music/pl.m3u", FileType::Playlist, folder.id)
            .await
            .unwrap()
            .unwrap();
        let mut item = Item::new(task, "file:///music/pl.m3u".to_string(), FileType::Playlist);
        item.parent_folder = Some(folder.clone());
        item.sub_items = vec![
            crate::parser::item::SubItem {
                mrl: "file:///music/a.mp3".to_string(),
                title: None,
                description: None,
                release_date: None,
                index: 0,
            },
            crate::parser::item::SubItem {
                mrl: "file:///music/b.mp3".to_string(),
                title: None,
                description: None,
                release_date: None,
                index: 1,
            },
        ];
        assert_eq!(analyzer.run(&mut item).await, Status::Completed);

        let (playlists,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM playlists")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(playlists, 1);
        let links: Vec<(i64, Option<String>)> = sqlx::query_as(
            "SELECT link_extra, mrl FROM tasks WHERE type = 3 ORDER BY link_extra",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].1.as_deref(), Some("file:///music/a.mp3"));
        assert_eq!(links[1].1.as_deref(), Some("file:///music/b.mp3"));
    }

    #[test]
    fn test_parse_year() {
        assert_eq!(parse_year(Some("1999")), Some(1999));
        assert_eq!(parse_year(Some("1999-05-12")), Some(1999));
        assert_eq!(parse_year(Some("12-05-1999")), Some(1999));
        assert_eq!(parse_year(Some("not a date")), None);
        assert_eq!(parse_year(None), None);
    }
}
