//! Storyboard ingestion and shot-to-segment conversion.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::ids::{BeatId, SceneId};
use crate::model::{Beat, EditorData, GenerationStatus, Scene};
use crate::WorkflowError;

/// One row of a generated storyboard.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StoryboardScene {
    #[serde(default)]
    pub scene_number: Option<u32>,
    #[serde(default)]
    pub narration: Option<String>,
    #[serde(default)]
    pub visual_description: Option<String>,
}

/// Groups storyboard rows by scene number into scenes and beats. The total
/// duration is split evenly across rows.
pub fn editor_data_from_storyboard(storyboard: &[StoryboardScene], duration: f64) -> EditorData {
    let mut data = EditorData::default();
    let per_beat = duration.max(0.0) / storyboard.len().max(1) as f64;
    let mut by_number: BTreeMap<u32, SceneId> = BTreeMap::new();

    for (idx, row) in storyboard.iter().enumerate() {
        let number = row.scene_number.unwrap_or(idx as u32 + 1);
        let scene_id = by_number
            .entry(number)
            .or_insert_with(|| {
                let scene = Scene {
                    id: SceneId::new(),
                    title: format!("Scene {number}"),
                    summary: String::new(),
                    order: data.scene_order.len() as u32,
                    beat_ids: Vec::new(),
                };
                data.scene_order.push(scene.id.clone());
                let id = scene.id.clone();
                data.scenes.insert(id.clone(), scene);
                id
            })
            .clone();

        let Some(scene) = data.scenes.get_mut(&scene_id) else {
            continue;
        };
        let mut beat = Beat::new(BeatId::new(), scene_id.clone(), scene.beat_ids.len() as u32);
        beat.narration = Some(row.narration.clone().unwrap_or_default());
        beat.dialogue = Some(String::new());
        beat.camera_description = Some(row.visual_description.clone().unwrap_or_default());
        beat.suggested_duration = per_beat;
        beat.status = GenerationStatus::Success;
        scene.beat_ids.push(beat.id.clone());
        data.beats.insert(beat.id.clone(), beat);
    }
    data
}

/// Replaces a beat by one beat per shot, in shot order, and returns the new
/// beat ids. A beat without shots is left alone and yields no ids.
pub fn split_shots_into_beats(
    data: &mut EditorData,
    beat_id: &BeatId,
) -> Result<Vec<BeatId>, WorkflowError> {
    let beat = data
        .beats
        .get(beat_id)
        .cloned()
        .ok_or_else(|| WorkflowError::BeatNotFound(beat_id.clone()))?;
    let mut shots = beat.shots.clone().unwrap_or_default();
    if shots.is_empty() {
        return Ok(Vec::new());
    }
    shots.sort_by_key(|shot| shot.order);

    let scene = data
        .scenes
        .get_mut(&beat.scene_id)
        .ok_or_else(|| WorkflowError::BeatNotFound(beat_id.clone()))?;
    let position = scene
        .beat_ids
        .iter()
        .position(|id| id == beat_id)
        .ok_or_else(|| WorkflowError::BeatNotFound(beat_id.clone()))?;

    let segments: Vec<Beat> = shots
        .iter()
        .enumerate()
        .map(|(offset, shot)| Beat {
            id: BeatId::new(),
            order: (position + offset) as u32,
            narration: shot.narration.clone().or_else(|| beat.narration.clone()),
            camera_description: shot.camera_description.clone(),
            suggested_duration: shot.suggested_duration,
            shots: None,
            ..beat.clone()
        })
        .collect();
    let new_ids: Vec<BeatId> = segments.iter().map(|segment| segment.id.clone()).collect();
    scene.beat_ids.splice(position..=position, new_ids.iter().cloned());
    for (order, id) in scene.beat_ids.iter().enumerate() {
        if let Some(existing) = data.beats.get_mut(id) {
            existing.order = order as u32;
        }
    }
    for segment in segments {
        data.beats.insert(segment.id.clone(), segment);
    }
    data.beats.remove(beat_id);
    for item in data.timeline_items.values_mut() {
        if item.linked_beat_id.as_ref() == Some(beat_id) {
            item.linked_beat_id = new_ids.first().cloned();
        }
    }
    Ok(new_ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ShotId;
    use crate::model::Shot;

    fn row(scene_number: Option<u32>, narration: &str) -> StoryboardScene {
        StoryboardScene {
            scene_number,
            narration: Some(narration.into()),
            visual_description: Some(format!("{narration} visual")),
        }
    }

    #[test]
    fn groups_rows_by_scene_number() {
        let data = editor_data_from_storyboard(
            &[row(Some(1), "a"), row(Some(1), "b"), row(Some(2), "c")],
            30.0,
        );
        assert_eq!(data.scene_order.len(), 2);
        let beats: Vec<_> = data.ordered_beats().map(|(_, beat)| beat.clone()).collect();
        assert_eq!(beats.len(), 3);
        assert_eq!(beats[1].order, 1);
        assert_eq!(beats[2].order, 0);
        assert_eq!(beats[0].camera_text(), "a visual");
        assert!((beats[0].suggested_duration - 10.0).abs() < f64::EPSILON);
        let first_scene = &data.scenes[&data.scene_order[0]];
        assert_eq!(first_scene.title, "Scene 1");
    }

    #[test]
    fn missing_scene_number_uses_row_position() {
        let data = editor_data_from_storyboard(&[row(None, "a"), row(None, "b")], -5.0);
        assert_eq!(data.scene_order.len(), 2);
        assert_eq!(data.scenes[&data.scene_order[1]].title, "Scene 2");
        assert!(data.beats.values().all(|beat| beat.suggested_duration == 0.0));
    }

    #[test]
    fn shots_become_beats_in_place() {
        let mut data = editor_data_from_storyboard(&[row(Some(1), "a"), row(Some(1), "b")], 10.0);
        let scene_id = data.scene_order[0].clone();
        let target = data.scenes[&scene_id].beat_ids[0].clone();
        let shots = (0..2)
            .map(|order| Shot {
                id: ShotId::new(),
                beat_id: target.clone(),
                order,
                narration: Some(format!("shot {order}")),
                camera_description: None,
                suggested_duration: 2.5,
            })
            .collect();
        data.beats.get_mut(&target).unwrap().shots = Some(shots);

        let segments = split_shots_into_beats(&mut data, &target).unwrap();
        assert_eq!(segments.len(), 2);
        let first = segments[0].clone();
        let scene = &data.scenes[&scene_id];
        assert_eq!(scene.beat_ids.len(), 3);
        assert_eq!(scene.beat_ids[0], first);
        assert!(!data.beats.contains_key(&target));
        assert_eq!(data.beats[&first].narration_text(), "shot 0");
        assert_eq!(data.beats[&scene.beat_ids[2]].order, 2);
    }

    #[test]
    fn beat_without_shots_is_untouched() {
        let mut data = editor_data_from_storyboard(&[row(Some(1), "a")], 10.0);
        let beat_id = data.scene_order.first().map(|id| data.scenes[id].beat_ids[0].clone()).unwrap();
        assert!(split_shots_into_beats(&mut data, &beat_id).unwrap().is_empty());
        assert!(data.beats.contains_key(&beat_id));
        assert!(split_shots_into_beats(&mut data, &BeatId::from("nope")).is_err());
    }
}
